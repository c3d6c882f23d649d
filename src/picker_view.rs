use makepad_widgets::*;
use std::time::Instant;

use crate::config::MapPickerConfig;
use crate::coords::Coordinate;
use crate::geometry::{BuildStep, Geometry, Shape, ShapeBuilder, ShapeId, ShapeKind};
use crate::lifecycle::Attachment;
use crate::picker::{MapEvent, MapPicker, PickerNotice};
use crate::session::{MapSession, MapView};
use crate::tiles::TileCache;

live_design! {
    link widgets;
    use link::shaders::*;
    use link::widgets::*;
    use link::theme::*;

    // Map tile with UV offset/scale for parent tile fallback
    DrawMapTile = {{DrawMapTile}} {
        texture tile_texture: texture2d
        has_texture: 0.0
        uv_offset: vec2(0.0, 0.0)
        uv_scale: vec2(1.0, 1.0)

        fn pixel(self) -> vec4 {
            if self.has_texture > 0.5 {
                let uv = self.uv_offset + self.pos * self.uv_scale;
                return sample2d(self.tile_texture, uv)
            }
            return vec4(0.95, 0.95, 0.95, 1.0)
        }
    }

    // Drop shaped marker, tip at the bottom center of the rect
    DrawPin = {{DrawPin}} {
        fn pixel(self) -> vec4 {
            let sdf = Sdf2d::viewport(self.pos * self.rect_size);
            let w = self.rect_size.x;
            let h = self.rect_size.y;
            let r = w * 0.4;
            sdf.move_to(w * 0.5 - r * 0.75, r * 1.6);
            sdf.line_to(w * 0.5, h - 1.0);
            sdf.line_to(w * 0.5 + r * 0.75, r * 1.6);
            sdf.close_path();
            sdf.fill(self.color);
            sdf.circle(w * 0.5, r + 1.0, r);
            sdf.fill(self.color);
            sdf.circle(w * 0.5, r + 1.0, r * 0.4);
            sdf.fill(#fff);
            return sdf.result
        }
    }

    DrawRing = {{DrawRing}} {
        stroke_width: 2.0
        fn pixel(self) -> vec4 {
            let sdf = Sdf2d::viewport(self.pos * self.rect_size);
            let c = self.rect_size * 0.5;
            sdf.circle(c.x, c.y, max(min(c.x, c.y) - self.stroke_width, 1.0));
            sdf.fill_keep(self.fill_color);
            sdf.stroke(self.stroke_color, self.stroke_width);
            return sdf.result
        }
    }

    DrawSegment = {{DrawSegment}} {
        line_width: 3.0
        fn pixel(self) -> vec4 {
            let sdf = Sdf2d::viewport(self.pos * self.rect_size);
            sdf.move_to(self.p0.x, self.p0.y);
            sdf.line_to(self.p1.x, self.p1.y);
            sdf.stroke(self.color, self.line_width);
            return sdf.result
        }
    }

    pub MapPickerViewBase = {{MapPickerView}} {
        draw_area_fill: {
            color: #3388ff33
        }
        draw_label: {
            color: #222222
            text_style: <THEME_FONT_REGULAR> {
                font_size: 10.0
            }
        }
        draw_popup_bg: {
            color: #ffffffee
        }
        draw_button_bg: {
            color: #ffffffee
        }
        draw_button_text: {
            color: #333333
            text_style: <THEME_FONT_BOLD> {
                font_size: 11.0
            }
        }
        draw_scale_bg: {
            color: #333333
        }
        draw_scale_text: {
            color: #333333
            text_style: <THEME_FONT_REGULAR> {
                font_size: 10.0
            }
        }
        draw_attribution_bg: {
            color: #ffffffcc
        }
        draw_attribution_text: {
            color: #666666
            text_style: <THEME_FONT_REGULAR> {
                font_size: 9.0
            }
        }
    }

    pub MapPickerView = <MapPickerViewBase> {
        width: Fill,
        height: 400,
    }
}

#[derive(Live, LiveRegister, LiveHook)]
#[repr(C)]
pub struct DrawMapTile {
    #[deref] pub draw_super: DrawQuad,
    #[live] pub has_texture: f32,
    #[live] pub uv_offset: Vec2,
    #[live] pub uv_scale: Vec2,
}

#[derive(Live, LiveRegister, LiveHook)]
#[repr(C)]
pub struct DrawPin {
    #[deref] pub draw_super: DrawQuad,
    #[live] pub color: Vec4,
}

#[derive(Live, LiveRegister, LiveHook)]
#[repr(C)]
pub struct DrawRing {
    #[deref] pub draw_super: DrawQuad,
    #[live] pub fill_color: Vec4,
    #[live] pub stroke_color: Vec4,
    #[live] pub stroke_width: f32,
}

#[derive(Live, LiveRegister, LiveHook)]
#[repr(C)]
pub struct DrawSegment {
    #[deref] pub draw_super: DrawQuad,
    #[live] pub color: Vec4,
    #[live] pub line_width: f32,
    #[live] pub p0: Vec2,
    #[live] pub p1: Vec2,
}

#[derive(Clone, Debug, DefaultNone)]
pub enum MapPickerAction {
    None,
    /// Picked coordinate moved, the remote write is still pending
    CoordinatesChanged { lat: f64, lng: f64 },
    CoordinatesWritten { lat: f64, lng: f64 },
    GeometryChanged,
    RegionChanged {
        center_lat: f64,
        center_lng: f64,
        zoom: f64,
    },
    LongPressed { lat: f64, lng: f64 },
}

/// Scale bar step values in meters (from 10m to 1000km)
const SCALE_STEPS: &[f64] = &[
    10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
    10000.0, 20000.0, 50000.0, 100000.0, 200000.0, 500000.0, 1000000.0,
];

const DEFAULT_ATTRIBUTION: &str = "\u{00A9} OpenStreetMap contributors";

/// Pixel distance under which a press still counts as a tap
const TAP_SLOP: f64 = 4.0;
/// Pixel radius for grabbing a vertex handle
const HANDLE_RADIUS: f64 = 8.0;
/// Circles larger than this on screen are not drawn
const MAX_RING_PX: f64 = 20000.0;

const BUTTON_SIZE: f64 = 28.0;

/// Colors and switches derived once from the picker configuration
#[derive(Clone, Debug, Default)]
struct ViewStyle {
    marker_color: Vec4,
    shape_color: Vec4,
    shape_fill: Vec4,
    marker_size: DVec2,
    marker_anchor: DVec2,
    editing: bool,
    deleting: bool,
    show_locate: bool,
    zoom_control: bool,
    attribution: String,
}

impl ViewStyle {
    fn from_config(config: &MapPickerConfig) -> Self {
        let geo = &config.geometry;
        let mut shape_fill = parse_color(&geo.filled_color, vec4(0.79, 0.85, 0.93, 1.0));
        shape_fill.w *= 0.5;
        Self {
            marker_color: parse_color(&config.marker_color, vec4(0.23, 0.51, 0.96, 1.0)),
            shape_color: parse_color(&geo.color, vec4(0.2, 0.53, 1.0, 1.0)),
            shape_fill,
            marker_size: dvec2(config.marker_icon_size[0], config.marker_icon_size[1]),
            marker_anchor: dvec2(config.marker_icon_anchor[0], config.marker_icon_anchor[1]),
            editing: geo.show && geo.edit_polygon,
            deleting: geo.show && geo.delete_layer,
            show_locate: config.show_my_location_button,
            zoom_control: config.controls.zoom_control,
            attribution: config
                .attribution
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| DEFAULT_ATTRIBUTION.to_string()),
        }
    }
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`
fn parse_color(hex: &str, fallback: Vec4) -> Vec4 {
    let digits = hex.trim().trim_start_matches('#');
    let expanded: String = match digits.len() {
        3 => digits.chars().flat_map(|c| [c, c]).collect(),
        6 | 8 => digits.to_string(),
        _ => return fallback,
    };
    let channel = |i: usize| u8::from_str_radix(expanded.get(i..i + 2)?, 16).ok().map(|v| v as f32 / 255.0);
    let alpha = if expanded.len() == 8 { channel(6) } else { Some(1.0) };
    match (channel(0), channel(2), channel(4), alpha) {
        (Some(r), Some(g), Some(b), Some(a)) => vec4(r, g, b, a),
        _ => fallback,
    }
}

/// Visible fraction of `full` given its clipped rect
fn visible_ratio(full: Rect, clipped: Rect) -> f64 {
    let full_area = full.size.x * full.size.y;
    if full_area <= 0.0 {
        return 0.0;
    }
    let visible = clipped.size.x.max(0.0) * clipped.size.y.max(0.0);
    (visible / full_area).clamp(0.0, 1.0)
}

/// Editable vertex handle closest to `local`, within the grab radius
fn vertex_at(session: &MapSession, local: DVec2) -> Option<(ShapeId, usize)> {
    let mut best: Option<(f64, ShapeId, usize)> = None;
    for drawn in session.geometry.iter().filter(|d| d.editable) {
        for (index, vertex) in drawn.shape.geometry.vertices().iter().enumerate() {
            let (x, y) = session.view.geo_to_screen(vertex);
            let distance = (dvec2(x, y) - local).length();
            if distance <= HANDLE_RADIUS && best.map_or(true, |(d, _, _)| distance < d) {
                best = Some((distance, drawn.id, index));
            }
        }
    }
    best.map(|(_, id, index)| (id, index))
}

/// Topmost shape under `local`: near one of its vertices or inside its
/// screen bounding box
fn shape_at(session: &MapSession, local: DVec2) -> Option<ShapeId> {
    let view = &session.view;
    session
        .geometry
        .iter()
        .rev()
        .find(|drawn| {
            let geometry = &drawn.shape.geometry;
            let near_vertex = geometry.vertices().iter().any(|v| {
                let (x, y) = view.geo_to_screen(v);
                (dvec2(x, y) - local).length() <= HANDLE_RADIUS * 1.5
            });
            near_vertex
                || geometry.bounds().is_some_and(|b| {
                    let (x0, y0) = view.geo_to_screen(&Coordinate::new(b.ne.lat, b.sw.lng));
                    let (x1, y1) = view.geo_to_screen(&Coordinate::new(b.sw.lat, b.ne.lng));
                    local.x >= x0 && local.x <= x1 && local.y >= y0 && local.y <= y1
                })
        })
        .map(|drawn| drawn.id)
}

#[derive(Clone, Copy, Debug)]
enum Gesture {
    /// Finger down on the map, panning once it moves past the tap slop
    Press { start_abs: DVec2, start_center: Coordinate, moved: bool },
    /// Dragging one vertex handle of an editable shape
    Vertex { id: ShapeId, index: usize },
}

/// Makepad front end of a [`MapPicker`].
///
/// The widget owns the picker once attached, draws whatever session it
/// holds and turns pointer input into map events. A session only exists
/// while the widget's area is on screen.
#[derive(Live, LiveHook, Widget)]
pub struct MapPickerView {
    #[walk] walk: Walk,
    #[redraw] #[live] pub draw_tile: DrawMapTile,

    #[live] draw_pin: DrawPin,
    #[live] draw_ring: DrawRing,
    #[live] draw_segment: DrawSegment,
    #[live] draw_area_fill: DrawColor,
    #[live] draw_label: DrawText,
    #[live] draw_popup_bg: DrawColor,
    #[live] draw_button_bg: DrawColor,
    #[live] draw_button_text: DrawText,

    #[live] draw_scale_bg: DrawColor,
    #[live] draw_scale_text: DrawText,
    #[live(true)] pub show_scale_bar: bool,

    #[live] draw_attribution_bg: DrawColor,
    #[live] draw_attribution_text: DrawText,
    #[live(true)] pub show_attribution: bool,

    /// Seconds between controller ticks
    #[live(0.1)] pub tick_interval: f64,

    #[live(0.95)] pub momentum_decay: f64,
    #[live(0.5)] pub momentum_threshold: f64,

    #[rust] picker: Option<MapPicker>,
    #[rust] style: ViewStyle,
    #[rust] attached: bool,
    #[rust] epoch: Option<Instant>,
    #[rust] timer: Timer,
    #[rust] tile_cache: Option<TileCache>,
    #[rust] drawn_stamp: Option<(u64, u64)>,
    #[rust] reported_ratio: Option<f64>,

    #[rust] origin: DVec2,
    #[rust] viewport_size: DVec2,

    #[rust] gesture: Option<Gesture>,
    #[rust] vertex_preview: Option<(ShapeId, Shape)>,
    #[rust] draw_tool: Option<ShapeBuilder>,
    #[rust] selected: Option<ShapeId>,

    #[rust] locate_rect: Option<Rect>,
    #[rust] zoom_in_rect: Option<Rect>,
    #[rust] zoom_out_rect: Option<Rect>,

    // Pinch zoom state
    #[rust] initial_pinch_distance: Option<f64>,
    #[rust] pinch_zoom_start: Option<f64>,

    // Momentum scrolling state
    #[rust] velocity_samples: Vec<(DVec2, f64)>,
    #[rust] flick_velocity: DVec2,
    #[rust] next_frame: NextFrame,
    #[rust] is_flicking: bool,
}

impl Widget for MapPickerView {
    fn handle_event(&mut self, cx: &mut Cx, event: &Event, scope: &mut Scope) {
        let uid = self.widget_uid();
        if self.picker.is_none() {
            return;
        }

        if let Event::NetworkResponses(responses) = event {
            if let Some(cache) = self.tile_cache.as_mut() {
                for response in responses {
                    match &response.response {
                        NetworkResponse::HttpResponse(http_response) => {
                            if cache.handle_response(cx, response.request_id, http_response) {
                                self.draw_tile.redraw(cx);
                            }
                        }
                        NetworkResponse::HttpRequestError(error) => {
                            cache.handle_error(response.request_id, error);
                        }
                        _ => {}
                    }
                }
            }
        }

        if self.timer.is_event(event).is_some() {
            self.tick(cx);
        }

        if self.next_frame.is_event(event).is_some() && self.is_flicking {
            self.apply_momentum(cx, uid, &scope.path);
        }

        if let Event::TouchUpdate(te) = event {
            if te.touches.len() >= 2 {
                let t0 = &te.touches[0];
                let t1 = &te.touches[1];
                let distance = (t1.abs - t0.abs).length();
                match (self.initial_pinch_distance, self.pinch_zoom_start) {
                    (Some(initial_distance), Some(start_zoom)) if initial_distance > 0.0 => {
                        let zoom_delta = (distance / initial_distance).ln() / std::f64::consts::LN_2;
                        self.map_event(MapEvent::ZoomEnd { zoom: start_zoom + zoom_delta });
                    }
                    _ => {
                        self.initial_pinch_distance = Some(distance);
                        self.pinch_zoom_start = self.view().map(|v| v.zoom);
                    }
                }
                self.gesture = None;
            }
        }

        match event.hits(cx, self.draw_tile.area()) {
            Hit::FingerDown(fe) if fe.is_primary_hit() => {
                cx.set_key_focus(self.draw_tile.area());
                self.is_flicking = false;
                self.velocity_samples.clear();
                self.velocity_samples.push((fe.abs, fe.time));

                let local = fe.abs - self.origin;
                let session = self.picker.as_ref().and_then(|p| p.session());
                let vertex = match session {
                    Some(session) if self.style.editing && self.draw_tool.is_none() => vertex_at(session, local),
                    _ => None,
                };
                self.gesture = match (vertex, session) {
                    (Some((id, index)), _) => Some(Gesture::Vertex { id, index }),
                    (None, Some(session)) => Some(Gesture::Press {
                        start_abs: fe.abs,
                        start_center: session.view.center,
                        moved: false,
                    }),
                    (None, None) => None,
                };
            }
            Hit::FingerMove(fe) => {
                let view = self.view();
                match (self.gesture, view) {
                    (Some(Gesture::Press { start_abs, start_center, moved }), Some(view)) if self.initial_pinch_distance.is_none() => {
                        let delta = fe.abs - start_abs;
                        let moved = moved || delta.length() > TAP_SLOP;
                        self.gesture = Some(Gesture::Press { start_abs, start_center, moved });
                        if moved && view.dragging {
                            let center = view.dragged_center(&start_center, delta.x, delta.y);
                            self.map_event(MapEvent::Move { center });

                            self.velocity_samples.push((fe.abs, fe.time));
                            if self.velocity_samples.len() > 4 {
                                self.velocity_samples.remove(0);
                            }
                        }
                    }
                    (Some(Gesture::Vertex { id, index }), Some(view)) => {
                        let local = fe.abs - self.origin;
                        let to = view.screen_to_geo(local.x, local.y);
                        let current = match self.vertex_preview.take() {
                            Some((preview_id, shape)) if preview_id == id => Some(shape),
                            _ => self
                                .picker
                                .as_ref()
                                .and_then(|p| p.session())
                                .and_then(|s| s.geometry.get(id))
                                .map(|d| d.shape.clone()),
                        };
                        if let Some(mut shape) = current {
                            shape.geometry.move_vertex(index, to);
                            self.vertex_preview = Some((id, shape));
                            self.draw_tile.redraw(cx);
                        }
                    }
                    _ => {}
                }
            }
            Hit::FingerUp(fe) if fe.is_primary_hit() => {
                self.initial_pinch_distance = None;
                self.pinch_zoom_start = None;

                match self.gesture.take() {
                    Some(Gesture::Vertex { id, .. }) => {
                        if let Some((_, shape)) = self.vertex_preview.take() {
                            if let Some(picker) = self.picker.as_mut() {
                                if let Err(e) = picker.shape_edited(id, shape) {
                                    error!("vertex edit rejected: {}", e);
                                }
                            }
                        }
                    }
                    Some(Gesture::Press { moved: false, .. }) if fe.is_over => {
                        self.handle_tap(cx, fe.abs, fe.tap_count);
                    }
                    Some(Gesture::Press { moved: true, .. }) => {
                        let velocity = self.calculate_flick_velocity();
                        let speed = velocity.length();
                        let dragging = self.view().is_some_and(|v| v.dragging);
                        if dragging && speed > self.momentum_threshold {
                            self.flick_velocity = velocity;
                            self.is_flicking = true;
                            self.next_frame = cx.new_next_frame();
                        } else {
                            self.end_move();
                        }
                    }
                    _ => {}
                }
                self.velocity_samples.clear();
                self.emit_region_changed(cx, uid, &scope.path);
            }
            Hit::FingerScroll(fe) => {
                if let Some(view) = self.view() {
                    let zoom_delta = if fe.scroll.y > 0.0 { 0.5 } else { -0.5 };
                    self.map_event(MapEvent::ZoomEnd { zoom: view.zoom + zoom_delta });
                    self.emit_region_changed(cx, uid, &scope.path);
                }
            }
            Hit::FingerLongPress(fe) => {
                if let Some(view) = self.view() {
                    let local = fe.abs - self.origin;
                    let at = view.screen_to_geo(local.x, local.y);
                    if self.style.deleting {
                        self.remove_shape_at(local);
                    }
                    cx.widget_action(uid, &scope.path, MapPickerAction::LongPressed { lat: at.lat, lng: at.lng });
                }
            }
            Hit::KeyDown(ke) => match ke.key_code {
                KeyCode::Escape => {
                    if let Some(builder) = self.draw_tool.as_mut() {
                        builder.cancel();
                    }
                    self.selected = None;
                    self.draw_tile.redraw(cx);
                }
                KeyCode::ReturnKey => self.finish_shape(cx),
                _ => {}
            },
            _ => {}
        }

        self.flush_notices(cx, uid, &scope.path);
        self.sync_redraw(cx);
    }

    fn draw_walk(&mut self, cx: &mut Cx2d, _scope: &mut Scope, walk: Walk) -> DrawStep {
        cx.begin_turtle(walk, Layout::default());
        let rect = cx.turtle().rect();
        self.origin = rect.pos;
        self.viewport_size = rect.size;

        let now = self.now();
        let attached = self.attached;
        // held out of self while drawing so the session can be borrowed
        let mut picker = self.picker.take();
        if let Some(picker) = picker.as_mut() {
            picker.set_viewport(rect.size.x, rect.size.y);
            // drawing proves the container exists, rearm a probe that gave up
            if attached && *picker.lifecycle().attachment() == Attachment::Detached {
                picker.attach(now);
            }
        }

        match picker.as_ref().and_then(|p| p.session()) {
            Some(session) => {
                if self.tile_cache.is_none() {
                    if let Some(layer) = session.tile_layer.clone() {
                        let hidpi = cx.current_dpi_factor() > 1.0;
                        self.tile_cache = Some(TileCache::new(layer, hidpi));
                    }
                }
                self.draw_tiles(cx, &session.view, rect);
                self.draw_overlays(cx, session);
                self.draw_controls(cx, &session.view, rect);
            }
            None => {
                self.tile_cache = None;
                self.selected = None;
                self.vertex_preview = None;
                self.draw_tile.has_texture = 0.0;
                self.draw_tile.draw_abs(cx, rect);
            }
        }
        self.picker = picker;

        cx.end_turtle_with_area(&mut self.draw_tile.draw_super.draw_vars.area);
        DrawStep::done()
    }
}

impl MapPickerView {
    fn now(&mut self) -> f64 {
        self.epoch.get_or_insert_with(Instant::now).elapsed().as_secs_f64()
    }

    fn view(&self) -> Option<MapView> {
        Some(self.picker.as_ref()?.session()?.view.clone())
    }

    fn map_event(&mut self, event: MapEvent) {
        let now = self.now();
        if let Some(picker) = self.picker.as_mut() {
            picker.handle_map_event(event, now);
        }
    }

    fn end_move(&mut self) {
        if let Some(view) = self.view() {
            self.map_event(MapEvent::MoveEnd { center: view.center, zoom: view.zoom });
        }
    }

    /// Take ownership of a picker and start driving it
    pub fn attach(&mut self, cx: &mut Cx, mut picker: MapPicker) {
        self.detach(cx);
        let now = self.now();
        self.style = ViewStyle::from_config(picker.config());
        picker.attach(now);
        self.picker = Some(picker);
        self.attached = true;
        self.timer = cx.start_interval(self.tick_interval);
        self.draw_tile.redraw(cx);
    }

    /// Tear down the session and hand the picker back
    pub fn detach(&mut self, cx: &mut Cx) -> Option<MapPicker> {
        cx.stop_timer(self.timer);
        self.timer = Timer::default();
        self.attached = false;
        self.tile_cache = None;
        self.gesture = None;
        self.vertex_preview = None;
        self.draw_tool = None;
        self.reported_ratio = None;
        let mut picker = self.picker.take()?;
        picker.detach();
        self.draw_tile.redraw(cx);
        Some(picker)
    }

    fn tick(&mut self, cx: &mut Cx) {
        let now = self.now();
        let area = self.draw_tile.area();
        let ready = area.is_valid(cx);
        let ratio = if ready { visible_ratio(area.rect(cx), area.clipped_rect(cx)) } else { 0.0 };
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        picker.poll_container(ready, now);
        if picker.lifecycle().is_observing() && self.reported_ratio != Some(ratio) {
            picker.handle_intersection(ratio, now);
            self.reported_ratio = Some(ratio);
        }
        picker.tick(now);
        if picker.session().is_none() {
            self.gesture = None;
            self.vertex_preview = None;
            self.is_flicking = false;
        }
    }

    fn flush_notices(&mut self, cx: &mut Cx, uid: WidgetUid, path: &HeapLiveIdPath) {
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        for notice in picker.take_notices() {
            let action = match notice {
                PickerNotice::CoordinatesChanged(c) => MapPickerAction::CoordinatesChanged { lat: c.lat, lng: c.lng },
                PickerNotice::CoordinatesWritten(c) => MapPickerAction::CoordinatesWritten { lat: c.lat, lng: c.lng },
                PickerNotice::GeometryWritten => MapPickerAction::GeometryChanged,
            };
            cx.widget_action(uid, path, action);
        }
    }

    /// Redraw when the session changed since the last frame
    fn sync_redraw(&mut self, cx: &mut Cx) {
        let stamp = self
            .picker
            .as_ref()
            .and_then(|p| p.session().map(|s| (p.sessions_created(), s.revision())));
        if stamp != self.drawn_stamp {
            self.drawn_stamp = stamp;
            self.draw_tile.redraw(cx);
        }
    }

    fn handle_tap(&mut self, cx: &mut Cx, abs: DVec2, tap_count: u32) {
        let Some(view) = self.view() else {
            return;
        };
        let hit = |r: Option<Rect>| r.is_some_and(|r| r.contains(abs));
        if hit(self.locate_rect) {
            self.locate_me();
            return;
        }
        if hit(self.zoom_in_rect) {
            self.map_event(MapEvent::ZoomEnd { zoom: view.zoom + 1.0 });
            return;
        }
        if hit(self.zoom_out_rect) {
            self.map_event(MapEvent::ZoomEnd { zoom: view.zoom - 1.0 });
            return;
        }
        if tap_count == 2 && self.draw_tool.is_none() {
            self.map_event(MapEvent::ZoomEnd { zoom: view.zoom + 1.0 });
            return;
        }

        let local = abs - self.origin;
        let at = view.screen_to_geo(local.x, local.y);
        if let Some(builder) = self.draw_tool.as_mut() {
            if let BuildStep::Done(geometry) = builder.push(at) {
                self.create_shape(geometry);
            }
            self.draw_tile.redraw(cx);
            return;
        }

        let shape = self.picker.as_ref().and_then(|p| p.session()).and_then(|s| shape_at(s, local));
        if shape.is_some() || self.selected.is_some() {
            self.selected = shape;
            self.draw_tile.redraw(cx);
        }
        if shape.is_none() {
            self.map_event(MapEvent::Click { at });
        }
    }

    fn create_shape(&mut self, geometry: Geometry) {
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        match picker.shape_created(Shape::new(geometry)) {
            Ok(id) => self.selected = Some(id),
            Err(e) => error!("shape not added: {}", e),
        }
    }

    fn remove_shape_at(&mut self, local: DVec2) {
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        let Some(session) = picker.session() else {
            return;
        };
        let Some(id) = shape_at(session, local).filter(|id| session.geometry.get(*id).is_some_and(|d| d.editable)) else {
            return;
        };
        if let Err(e) = picker.shape_removed(id) {
            error!("shape {} not removed: {}", id, e);
        }
        if self.selected == Some(id) {
            self.selected = None;
        }
    }

    /// Start drawing shapes of `kind` on taps, `None` returns to picking
    pub fn set_draw_tool(&mut self, cx: &mut Cx, kind: Option<ShapeKind>) {
        self.draw_tool = kind.map(ShapeBuilder::new);
        self.draw_tile.redraw(cx);
    }

    pub fn set_text_tool(&mut self, cx: &mut Cx, text: &str) {
        self.draw_tool = Some(ShapeBuilder::new(ShapeKind::Text).with_text(text));
        self.draw_tile.redraw(cx);
    }

    pub fn draw_tool(&self) -> Option<ShapeKind> {
        self.draw_tool.as_ref().map(ShapeBuilder::kind)
    }

    /// Close the polygon or polyline being drawn
    pub fn finish_shape(&mut self, cx: &mut Cx) {
        let Some(geometry) = self.draw_tool.as_mut().and_then(ShapeBuilder::finish) else {
            return;
        };
        self.create_shape(geometry);
        self.draw_tile.redraw(cx);
    }

    pub fn locate_me(&mut self) {
        if let Some(picker) = self.picker.as_mut() {
            picker.locate_me();
        }
    }

    pub fn picker(&self) -> Option<&MapPicker> {
        self.picker.as_ref()
    }

    pub fn picker_mut(&mut self) -> Option<&mut MapPicker> {
        self.picker.as_mut()
    }

    fn draw_tiles(&mut self, cx: &mut Cx2d, view: &MapView, rect: Rect) {
        let Some(cache) = self.tile_cache.as_mut() else {
            return;
        };
        let tiles = cache.layer().visible_tiles(&view.center, view.zoom, (rect.size.x, rect.size.y));
        for tile in tiles {
            cache.request_tile(cx.cx.cx, tile.coord);

            if let Some(texture) = cache.get_tile(&tile.coord) {
                self.draw_tile.draw_vars.set_texture(0, texture);
                self.draw_tile.has_texture = 1.0;
                self.draw_tile.uv_offset = vec2(0.0, 0.0);
                self.draw_tile.uv_scale = vec2(1.0, 1.0);
            } else if let Some((texture, uv_offset, uv_scale)) = cache.parent_fallback(&tile.coord) {
                self.draw_tile.draw_vars.set_texture(0, texture);
                self.draw_tile.has_texture = 1.0;
                self.draw_tile.uv_offset = uv_offset;
                self.draw_tile.uv_scale = uv_scale;
            } else {
                self.draw_tile.has_texture = 0.0;
            }

            let tile_rect = Rect {
                pos: rect.pos + dvec2(tile.x, tile.y),
                size: dvec2(tile.size, tile.size),
            };
            self.draw_tile.draw_abs(cx, tile_rect);
        }
    }

    fn screen(&self, view: &MapView, p: &Coordinate) -> DVec2 {
        let (x, y) = view.geo_to_screen(p);
        self.origin + dvec2(x, y)
    }

    fn stroke_segment(&mut self, cx: &mut Cx2d, a: DVec2, b: DVec2, color: Vec4) {
        let pad = self.draw_segment.line_width as f64 + 1.0;
        let min = dvec2(a.x.min(b.x) - pad, a.y.min(b.y) - pad);
        let max = dvec2(a.x.max(b.x) + pad, a.y.max(b.y) + pad);
        self.draw_segment.color = color;
        self.draw_segment.p0 = vec2((a.x - min.x) as f32, (a.y - min.y) as f32);
        self.draw_segment.p1 = vec2((b.x - min.x) as f32, (b.y - min.y) as f32);
        self.draw_segment.draw_abs(cx, Rect { pos: min, size: max - min });
    }

    fn stroke_path(&mut self, cx: &mut Cx2d, points: &[DVec2], closed: bool, color: Vec4) {
        for pair in points.windows(2) {
            self.stroke_segment(cx, pair[0], pair[1], color);
        }
        if closed && points.len() > 2 {
            self.stroke_segment(cx, points[points.len() - 1], points[0], color);
        }
    }

    fn ring(&mut self, cx: &mut Cx2d, center: DVec2, radius: f64, fill: Vec4, stroke: Vec4) {
        if !(radius.is_finite() && radius > 0.0 && radius < MAX_RING_PX) {
            return;
        }
        self.draw_ring.fill_color = fill;
        self.draw_ring.stroke_color = stroke;
        let r = radius + self.draw_ring.stroke_width as f64;
        self.draw_ring.draw_abs(cx, Rect {
            pos: center - dvec2(r, r),
            size: dvec2(r * 2.0, r * 2.0),
        });
    }

    fn pin(&mut self, cx: &mut Cx2d, tip: DVec2, color: Vec4) {
        let size = self.style.marker_size;
        let anchor = self.style.marker_anchor;
        self.draw_pin.color = color;
        self.draw_pin.draw_abs(cx, Rect { pos: tip - anchor, size });
    }

    fn handle(&mut self, cx: &mut Cx2d, at: DVec2) {
        let stroke = self.style.shape_color;
        self.ring(cx, at, HANDLE_RADIUS * 0.6, vec4(1.0, 1.0, 1.0, 1.0), stroke);
    }

    fn draw_shape(&mut self, cx: &mut Cx2d, view: &MapView, geometry: &Geometry) {
        let color = self.style.shape_color;
        let fill = self.style.shape_fill;
        match geometry {
            Geometry::Marker(p) => {
                let tip = self.screen(view, p);
                self.pin(cx, tip, color);
            }
            Geometry::CircleMarker { center, radius } => {
                let c = self.screen(view, center);
                self.ring(cx, c, *radius, fill, color);
            }
            Geometry::Circle { center, radius } => {
                let c = self.screen(view, center);
                self.ring(cx, c, radius / view.meters_per_pixel(), fill, color);
            }
            Geometry::Polygon(rings) => {
                for ring in rings {
                    let points: Vec<DVec2> = ring.iter().map(|p| self.screen(view, p)).collect();
                    self.stroke_path(cx, &points, true, color);
                }
            }
            Geometry::Polyline(points) => {
                let points: Vec<DVec2> = points.iter().map(|p| self.screen(view, p)).collect();
                self.stroke_path(cx, &points, false, color);
            }
            Geometry::Rectangle(bounds) => {
                let corners = [
                    bounds.sw,
                    Coordinate::new(bounds.ne.lat, bounds.sw.lng),
                    bounds.ne,
                    Coordinate::new(bounds.sw.lat, bounds.ne.lng),
                ];
                let points: Vec<DVec2> = corners.iter().map(|p| self.screen(view, p)).collect();
                let top_left = points[1];
                let bottom_right = points[3];
                self.draw_area_fill.color = fill;
                self.draw_area_fill.draw_abs(cx, Rect { pos: top_left, size: bottom_right - top_left });
                self.stroke_path(cx, &points, true, color);
            }
            Geometry::Text { at, text } => {
                let pos = self.screen(view, at);
                self.draw_label.draw_abs(cx, pos, text);
            }
        }
    }

    fn draw_overlays(&mut self, cx: &mut Cx2d, session: &MapSession) {
        let view = &session.view;

        if let (Some(circle), Some(_)) = (&session.range_circle, &session.marker) {
            let c = self.screen(view, &circle.center);
            let mut fill = self.style.marker_color;
            fill.w *= 0.15;
            let stroke = self.style.marker_color;
            self.ring(cx, c, circle.radius / view.meters_per_pixel(), fill, stroke);
        }

        for drawn in session.geometry.iter() {
            let shape = match &self.vertex_preview {
                Some((id, preview)) if *id == drawn.id => preview.clone(),
                _ => drawn.shape.clone(),
            };
            self.draw_shape(cx, view, &shape.geometry);
            if self.style.editing && drawn.editable && self.draw_tool.is_none() {
                for vertex in shape.geometry.vertices() {
                    let at = self.screen(view, &vertex);
                    self.handle(cx, at);
                }
            }
        }

        if let Some(points) = self.draw_tool.as_ref().map(|b| b.points().to_vec()) {
            let points: Vec<DVec2> = points.iter().map(|p| self.screen(view, p)).collect();
            let color = self.style.shape_color;
            self.stroke_path(cx, &points, false, color);
            for at in points {
                self.handle(cx, at);
            }
        }

        if let Some(marker) = &session.marker {
            let tip = self.screen(view, &marker.position);
            let color = self.style.marker_color;
            self.pin(cx, tip, color);
        }

        if let Some(drawn) = self.selected.and_then(|id| session.geometry.get(id)) {
            let anchor = drawn.shape.geometry.vertices().first().copied();
            if let Some(anchor) = anchor {
                let at = self.screen(view, &anchor);
                let font_size = self.draw_label.text_style.font_size as f64;
                let size = dvec2(drawn.popup.chars().count() as f64 * font_size * 0.6 + 12.0, font_size * 1.2 + 8.0);
                let pos = at - dvec2(size.x / 2.0, size.y + 12.0);
                self.draw_popup_bg.draw_abs(cx, Rect { pos, size });
                self.draw_label.draw_abs(cx, pos + dvec2(6.0, 4.0), &drawn.popup);
            }
        }
    }

    fn button(&mut self, cx: &mut Cx2d, pos: DVec2, label: &str) -> Rect {
        let rect = Rect { pos, size: dvec2(BUTTON_SIZE, BUTTON_SIZE) };
        self.draw_button_bg.draw_abs(cx, rect);
        self.draw_button_text.draw_abs(cx, pos + dvec2(BUTTON_SIZE * 0.3, BUTTON_SIZE * 0.2), label);
        rect
    }

    fn draw_controls(&mut self, cx: &mut Cx2d, view: &MapView, rect: Rect) {
        let margin = 10.0;

        self.zoom_in_rect = None;
        self.zoom_out_rect = None;
        if self.style.zoom_control {
            let pos = rect.pos + dvec2(margin, margin);
            self.zoom_in_rect = Some(self.button(cx, pos, "+"));
            self.zoom_out_rect = Some(self.button(cx, pos + dvec2(0.0, BUTTON_SIZE + 2.0), "-"));
        }

        self.locate_rect = None;
        if self.style.show_locate {
            let pos = rect.pos + dvec2(rect.size.x - margin - BUTTON_SIZE, margin);
            self.locate_rect = Some(self.button(cx, pos, "o"));
        }

        if self.show_scale_bar {
            let (bar_width, label) = calculate_scale_bar(view.meters_per_pixel(), 100.0);
            let bar_height = 4.0;
            let bar_y = rect.pos.y + rect.size.y - margin - bar_height;
            let bar_x = rect.pos.x + margin;
            self.draw_scale_bg.draw_abs(cx, Rect {
                pos: dvec2(bar_x, bar_y),
                size: dvec2(bar_width, bar_height),
            });
            self.draw_scale_text.draw_abs(cx, dvec2(bar_x, bar_y - 14.0), &label);
        }

        if self.show_attribution {
            let padding = 4.0;
            // Approximate width: half the font size per character
            let font_size = self.draw_attribution_text.text_style.font_size as f64;
            let text_width = self.style.attribution.chars().count() as f64 * font_size * 0.5;
            let text_height = font_size * 1.2;

            let bg_width = text_width + padding * 2.0;
            let bg_height = text_height + padding * 2.0;
            let bg_x = rect.pos.x + rect.size.x - margin - bg_width;
            let bg_y = rect.pos.y + rect.size.y - margin - bg_height;
            self.draw_attribution_bg.draw_abs(cx, Rect {
                pos: dvec2(bg_x, bg_y),
                size: dvec2(bg_width, bg_height),
            });
            let attribution = self.style.attribution.clone();
            self.draw_attribution_text.draw_abs(cx, dvec2(bg_x + padding, bg_y + padding), &attribution);
        }
    }

    /// Average drag velocity over the last samples, per ~60fps frame
    fn calculate_flick_velocity(&self) -> DVec2 {
        let mut total = dvec2(0.0, 0.0);
        let mut count = 0;
        for pair in self.velocity_samples.windows(2) {
            let (pos_prev, time_prev) = pair[0];
            let (pos_curr, time_curr) = pair[1];
            let dt = time_curr - time_prev;
            if dt > 0.0001 {
                total = total + (pos_curr - pos_prev) / dt;
                count += 1;
            }
        }
        if count == 0 {
            return dvec2(0.0, 0.0);
        }
        total / count as f64 * 0.016
    }

    fn apply_momentum(&mut self, cx: &mut Cx, uid: WidgetUid, path: &HeapLiveIdPath) {
        self.flick_velocity = self.flick_velocity * self.momentum_decay;
        let Some(view) = self.view() else {
            self.is_flicking = false;
            return;
        };
        if self.flick_velocity.length() < self.momentum_threshold * 0.01 {
            self.is_flicking = false;
            self.end_move();
            self.emit_region_changed(cx, uid, path);
            self.flush_notices(cx, uid, path);
            return;
        }
        let center = view.dragged_center(&view.center, self.flick_velocity.x, self.flick_velocity.y);
        self.map_event(MapEvent::Move { center });
        self.sync_redraw(cx);
        self.next_frame = cx.new_next_frame();
    }

    fn emit_region_changed(&self, cx: &mut Cx, uid: WidgetUid, path: &HeapLiveIdPath) {
        if let Some(view) = self.view() {
            cx.widget_action(uid, path, MapPickerAction::RegionChanged {
                center_lat: view.center.lat,
                center_lng: view.center.lng,
                zoom: view.zoom,
            });
        }
    }
}

/// Scale bar width in pixels and its label for at most `max_width` pixels
fn calculate_scale_bar(meters_per_pixel: f64, max_width: f64) -> (f64, String) {
    let max_meters = max_width * meters_per_pixel;
    let selected = SCALE_STEPS
        .iter()
        .copied()
        .take_while(|step| *step <= max_meters)
        .last()
        .unwrap_or(SCALE_STEPS[0]);
    let label = if selected >= 1000.0 {
        format!("{} km", (selected / 1000.0) as i32)
    } else {
        format!("{} m", selected as i32)
    };
    (selected / meters_per_pixel, label)
}

impl MapPickerViewRef {
    pub fn attach(&self, cx: &mut Cx, picker: MapPicker) {
        if let Some(mut inner) = self.borrow_mut() {
            inner.attach(cx, picker);
        }
    }

    pub fn detach(&self, cx: &mut Cx) -> Option<MapPicker> {
        self.borrow_mut()?.detach(cx)
    }

    /// Run `f` against the attached picker and redraw
    pub fn with_picker<R>(&self, cx: &mut Cx, f: impl FnOnce(&mut MapPicker) -> R) -> Option<R> {
        let mut inner = self.borrow_mut()?;
        let result = f(inner.picker.as_mut()?);
        inner.draw_tile.redraw(cx);
        Some(result)
    }

    pub fn set_draw_tool(&self, cx: &mut Cx, kind: Option<ShapeKind>) {
        if let Some(mut inner) = self.borrow_mut() {
            inner.set_draw_tool(cx, kind);
        }
    }

    pub fn set_text_tool(&self, cx: &mut Cx, text: &str) {
        if let Some(mut inner) = self.borrow_mut() {
            inner.set_text_tool(cx, text);
        }
    }

    pub fn finish_shape(&self, cx: &mut Cx) {
        if let Some(mut inner) = self.borrow_mut() {
            inner.finish_shape(cx);
        }
    }

    pub fn locate_me(&self) {
        if let Some(mut inner) = self.borrow_mut() {
            inner.locate_me();
        }
    }

    pub fn coordinates_changed(&self, actions: &Actions) -> Option<Coordinate> {
        let item = actions.find_widget_action(self.widget_uid())?;
        match item.cast() {
            MapPickerAction::CoordinatesChanged { lat, lng } => Some(Coordinate::new(lat, lng)),
            _ => None,
        }
    }

    pub fn coordinates_written(&self, actions: &Actions) -> Option<Coordinate> {
        let item = actions.find_widget_action(self.widget_uid())?;
        match item.cast() {
            MapPickerAction::CoordinatesWritten { lat, lng } => Some(Coordinate::new(lat, lng)),
            _ => None,
        }
    }

    pub fn geometry_changed(&self, actions: &Actions) -> bool {
        actions
            .find_widget_action(self.widget_uid())
            .is_some_and(|item| matches!(item.cast(), MapPickerAction::GeometryChanged))
    }

    pub fn region_changed(&self, actions: &Actions) -> Option<(Coordinate, f64)> {
        let item = actions.find_widget_action(self.widget_uid())?;
        match item.cast() {
            MapPickerAction::RegionChanged { center_lat, center_lng, zoom } => {
                Some((Coordinate::new(center_lat, center_lng), zoom))
            }
            _ => None,
        }
    }

    pub fn long_pressed(&self, actions: &Actions) -> Option<Coordinate> {
        let item = actions.find_widget_action(self.widget_uid())?;
        match item.cast() {
            MapPickerAction::LongPressed { lat, lng } => Some(Coordinate::new(lat, lng)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryCollection;

    #[test]
    fn parses_hex_colors() {
        let fallback = vec4(0.0, 0.0, 0.0, 0.0);
        assert_eq!(parse_color("#ff0000", fallback), vec4(1.0, 0.0, 0.0, 1.0));
        assert_eq!(parse_color("#fff", fallback), vec4(1.0, 1.0, 1.0, 1.0));
        assert_eq!(parse_color("00ff0000", fallback), vec4(0.0, 1.0, 0.0, 0.0));
        assert_eq!(parse_color("#zzzzzz", fallback), fallback);
        assert_eq!(parse_color("blue", fallback), fallback);
    }

    #[test]
    fn ratio_of_clipped_area() {
        let full = Rect { pos: dvec2(0.0, 0.0), size: dvec2(100.0, 100.0) };
        let half = Rect { pos: dvec2(0.0, 0.0), size: dvec2(100.0, 50.0) };
        assert_eq!(visible_ratio(full, half), 0.5);
        assert_eq!(visible_ratio(full, Rect::default()), 0.0);
        assert_eq!(visible_ratio(Rect::default(), full), 0.0);
    }

    #[test]
    fn scale_bar_picks_largest_fitting_step() {
        let (width, label) = calculate_scale_bar(3.0, 100.0);
        assert_eq!(label, "200 m");
        assert!((width - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(calculate_scale_bar(120.0, 100.0).1, "10 km");
    }

    fn session_with(shape: Geometry, editable: bool) -> (MapSession, ShapeId) {
        let mut session = MapSession::new(&MapPickerConfig::default());
        session.view.viewport = (400.0, 400.0);
        session.view.set_view(Coordinate::new(0.0, 0.0), Some(10.0));
        let mut geometry = GeometryCollection::new();
        let id = geometry.insert(Shape::new(shape), editable);
        session.geometry = geometry;
        (session, id)
    }

    #[test]
    fn grabs_vertex_handles_of_editable_shapes() {
        let (session, id) = session_with(Geometry::Marker(Coordinate::new(0.0, 0.0)), true);
        assert_eq!(vertex_at(&session, dvec2(203.0, 198.0)), Some((id, 0)));
        assert_eq!(vertex_at(&session, dvec2(230.0, 200.0)), None);

        let (locked, _) = session_with(Geometry::Marker(Coordinate::new(0.0, 0.0)), false);
        assert_eq!(vertex_at(&locked, dvec2(200.0, 200.0)), None);
    }

    #[test]
    fn finds_shape_inside_its_box() {
        let bounds = crate::coords::LatLngBounds::new(Coordinate::new(-0.1, -0.1), Coordinate::new(0.1, 0.1));
        let (session, id) = session_with(Geometry::Rectangle(bounds), false);
        assert_eq!(shape_at(&session, dvec2(210.0, 190.0)), Some(id));
        assert_eq!(shape_at(&session, dvec2(5.0, 5.0)), None);
    }
}
