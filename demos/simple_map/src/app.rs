use makepad_widgets::*;
use makepad_map_picker::*;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

live_design! {
    use link::theme::*;
    use link::shaders::*;
    use link::widgets::*;

    use makepad_map_picker::picker_view::MapPickerView;

    ToolButton = <Button> {
        width: Fit,
        height: Fit,
    }

    App = {{App}} {
        ui: <Root> {
            main_window = <Window> {
                window: { title: "Makepad Map Picker" },
                body = <View> {
                    flow: Down,

                    <View> {
                        width: Fill, height: 50.0
                        show_bg: true
                        draw_bg: { color: #2196F3 }
                        align: { x: 0.5, y: 0.5 }

                        <Label> {
                            width: Fit, height: Fit
                            draw_text: {
                                text_style: { font_size: 18.0 }
                                color: #ffffff
                            }
                            text: "Pick a location"
                        }
                    }

                    <View> {
                        height: Fit,
                        flow: Right,
                        spacing: 10,
                        padding: { top: 6, bottom: 6, left: 10, right: 10 },
                        align: { y: 0.5 }

                        status_label = <Label> {
                            width: Fill,
                            height: Fit,
                            text: "Drag the map to move the marker"
                            draw_text: {
                                text_style: { font_size: 12.0 }
                                color: #fff
                            }
                        }
                        radius_slider = <Slider> {
                            width: 220,
                            text: "Radius (m)"
                            min: 0.0,
                            max: 5000.0,
                            step: 50.0,
                            default: 500.0,
                        }
                    }

                    <View> {
                        height: Fit,
                        flow: Right,
                        spacing: 6,
                        padding: { left: 10, right: 10, bottom: 6 },

                        pick_btn = <ToolButton> { text: "Pick" }
                        marker_btn = <ToolButton> { text: "Marker" }
                        circle_btn = <ToolButton> { text: "Circle" }
                        polygon_btn = <ToolButton> { text: "Polygon" }
                        line_btn = <ToolButton> { text: "Line" }
                        rect_btn = <ToolButton> { text: "Rectangle" }
                        finish_btn = <ToolButton> { text: "Finish shape" }
                        locate_btn = <ToolButton> { text: "Locate me" }
                    }

                    <View> {
                        width: Fill,
                        height: Fill,

                        picker = <MapPickerView> {
                            width: Fill,
                            height: Fill,
                        }
                    }
                }
            }
        }
    }
}

app_main!(App);

const STATE_PATH: &str = "data.location";
const RANGE_PATH: &str = "data.distance";

#[derive(Live, LiveHook)]
pub struct App {
    #[live] ui: WidgetRef,
    /// Form state standing in for the server
    #[rust] wire: Option<Rc<RefCell<MemoryWire>>>,
}

impl LiveRegister for App {
    fn live_register(cx: &mut Cx) {
        makepad_widgets::live_design(cx);
        makepad_map_picker::live_design(cx);
    }
}

impl App {
    fn set_status(&self, cx: &mut Cx, text: &str) {
        self.ui.label(id!(status_label)).set_text(cx, text);
    }
}

impl MatchEvent for App {
    fn handle_startup(&mut self, cx: &mut Cx) {
        let config = json!({
            "statePath": STATE_PATH,
            "rangeSelectField": "distance",
            "showMyLocationButton": true,
            "clickable": true,
            "controls": { "zoom": 13, "zoomControl": true },
            "default": { "lat": 51.5, "lng": -0.12 },
            "geoMan": { "show": true, "drawText": false, "cutPolygon": false },
        });
        let config = match MapPickerConfig::from_value(config) {
            Ok(config) => config,
            Err(e) => {
                error!("demo configuration rejected: {}", e);
                return;
            }
        };

        let wire = Rc::new(RefCell::new(MemoryWire::with_state(json!({
            "data": {
                "location": { "lat": 51.5074, "lng": -0.1278 },
                "distance": 500,
            }
        }))));
        let geolocator = StaticGeolocator::new(Some(Coordinate::new(51.5033, -0.1196)));
        let picker = MapPicker::new(config, wire.clone(), geolocator);
        self.ui.map_picker_view(id!(picker)).attach(cx, picker);
        self.wire = Some(wire);
    }

    fn handle_actions(&mut self, cx: &mut Cx, actions: &Actions) {
        let map = self.ui.map_picker_view(id!(picker));

        if let Some(radius) = self.ui.slider(id!(radius_slider)).slided(actions) {
            if let Some(wire) = &self.wire {
                wire.borrow_mut().put(RANGE_PATH, json!(radius));
            }
            map.with_picker(cx, |picker| picker.range_field_changed());
        }

        let tools = [
            (id!(pick_btn), None),
            (id!(marker_btn), Some(ShapeKind::Marker)),
            (id!(circle_btn), Some(ShapeKind::Circle)),
            (id!(polygon_btn), Some(ShapeKind::Polygon)),
            (id!(line_btn), Some(ShapeKind::Polyline)),
            (id!(rect_btn), Some(ShapeKind::Rectangle)),
        ];
        for (button, tool) in tools {
            if self.ui.button(button).clicked(actions) {
                map.set_draw_tool(cx, tool);
                let text = match tool {
                    Some(kind) => format!("Drawing: {}", kind),
                    None => "Drag the map to move the marker".to_string(),
                };
                self.set_status(cx, &text);
            }
        }
        if self.ui.button(id!(finish_btn)).clicked(actions) {
            map.finish_shape(cx);
        }
        if self.ui.button(id!(locate_btn)).clicked(actions) {
            map.locate_me();
        }

        if let Some(c) = map.coordinates_written(actions) {
            self.set_status(cx, &format!("Saved: {:.5}, {:.5}", c.lat, c.lng));
        } else if let Some(c) = map.coordinates_changed(actions) {
            self.set_status(cx, &format!("Picked: {:.5}, {:.5}", c.lat, c.lng));
        } else if map.geometry_changed(actions) {
            let count = self
                .wire
                .as_ref()
                .and_then(|w| w.borrow().get(&format!("{STATE_PATH}.geojson")))
                .and_then(|g| g["features"].as_array().map(Vec::len))
                .unwrap_or(0);
            self.set_status(cx, &format!("{} shape(s) saved", count));
        } else if let Some(c) = map.long_pressed(actions) {
            self.set_status(cx, &format!("Long press at {:.5}, {:.5}", c.lat, c.lng));
        }
    }
}

impl AppMain for App {
    fn handle_event(&mut self, cx: &mut Cx, event: &Event) {
        self.match_event(cx, event);
        self.ui.handle_event(cx, event, &mut Scope::empty());
    }
}
