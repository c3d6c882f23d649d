use makepad_widgets::*;
use makepad_widgets::image_cache::ImageBuffer;
use std::collections::HashMap;

use crate::config::MapPickerConfig;
use crate::coords::{mercator, Coordinate};

/// Subdomains cycled through for `{s}` in tile URL templates
const SUBDOMAINS: &[&str] = &["a", "b", "c"];

/// Slippy map tile coordinates
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    pub fn parent(&self) -> Option<TileCoord> {
        (self.z > 0).then(|| TileCoord { x: self.x / 2, y: self.y / 2, z: self.z - 1 })
    }
}

/// Tile source of one map session, derived from the picker configuration
#[derive(Clone, Debug, PartialEq)]
pub struct TileLayer {
    pub url_template: String,
    pub attribution: Option<String>,
    pub tile_size: f64,
    pub zoom_offset: i32,
    pub detect_retina: bool,
    pub min_zoom: f64,
    pub max_zoom: f64,
}

impl TileLayer {
    pub fn from_config(config: &MapPickerConfig) -> Self {
        Self {
            url_template: config.tiles_url.clone(),
            attribution: config.attribution.clone(),
            tile_size: config.tile_size.max(1) as f64,
            zoom_offset: config.zoom_offset,
            detect_retina: config.detect_retina,
            min_zoom: config.min_zoom(),
            max_zoom: config.max_zoom(),
        }
    }

    /// Expand the URL template for one tile
    pub fn tile_url(&self, coord: &TileCoord, hidpi: bool) -> String {
        let subdomain = SUBDOMAINS[((coord.x as usize) + (coord.y as usize)) % SUBDOMAINS.len()];
        let retina = if hidpi && self.detect_retina { "@2x" } else { "" };
        self.url_template
            .replace("{s}", subdomain)
            .replace("{r}", retina)
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string())
    }

    /// Zoom level tiles are requested at for a view zoom
    pub fn tile_zoom(&self, zoom: f64) -> u8 {
        (zoom.floor() as i32 + self.zoom_offset).clamp(0, 30) as u8
    }

    /// Tiles covering a `viewport` sized view, with their screen rectangles
    /// relative to the viewport origin
    pub fn visible_tiles(&self, center: &Coordinate, zoom: f64, viewport: (f64, f64)) -> Vec<TilePlacement> {
        let z = self.tile_zoom(zoom);
        // Scale of a tile on screen relative to its native size
        let zoom_scale = 2.0_f64.powf(zoom - z as f64) * 256.0 / self.tile_size;
        let world_size = self.tile_size * 2.0_f64.powi(z as i32);
        let (center_x, center_y) = mercator::project(center, world_size);

        let scaled = self.tile_size * zoom_scale;
        let tiles_x = (viewport.0 / scaled / 2.0).ceil() as i32 + 1;
        let tiles_y = (viewport.1 / scaled / 2.0).ceil() as i32 + 1;
        let center_tile_x = (center_x / self.tile_size).floor() as i32;
        let center_tile_y = (center_y / self.tile_size).floor() as i32;
        let max_tile = 2_i64.pow(z as u32) as i32;

        let offset_x = (center_x - center_tile_x as f64 * self.tile_size) * zoom_scale;
        let offset_y = (center_y - center_tile_y as f64 * self.tile_size) * zoom_scale;

        let mut out = Vec::new();
        for dy in -tiles_y..=tiles_y {
            for dx in -tiles_x..=tiles_x {
                let tile_y = center_tile_y + dy;
                if tile_y < 0 || tile_y >= max_tile {
                    continue;
                }
                let tile_x = (center_tile_x + dx).rem_euclid(max_tile);
                out.push(TilePlacement {
                    coord: TileCoord { x: tile_x as u32, y: tile_y as u32, z },
                    x: viewport.0 / 2.0 + dx as f64 * scaled - offset_x,
                    y: viewport.1 / 2.0 + dy as f64 * scaled - offset_y,
                    size: scaled,
                });
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TilePlacement {
    pub coord: TileCoord,
    pub x: f64,
    pub y: f64,
    pub size: f64,
}

/// State of a tile being loaded
#[derive(Clone)]
pub enum TileState {
    Loading,
    Loaded(Texture),
    Error(String),
}

/// In-memory tile textures of one map session.
///
/// Dropping the cache releases every texture, which is how a session gives
/// its tile layer back.
pub struct TileCache {
    layer: TileLayer,
    tiles: HashMap<TileCoord, TileState>,
    pending_requests: HashMap<LiveId, TileCoord>,
    request_counter: u64,
    hidpi: bool,
}

impl TileCache {
    pub fn new(layer: TileLayer, hidpi: bool) -> Self {
        Self {
            layer,
            tiles: HashMap::new(),
            pending_requests: HashMap::new(),
            request_counter: 0,
            hidpi,
        }
    }

    pub fn layer(&self) -> &TileLayer {
        &self.layer
    }

    /// Request a tile if not already cached or loading
    pub fn request_tile(&mut self, cx: &mut Cx, coord: TileCoord) {
        if self.tiles.contains_key(&coord) {
            return;
        }

        self.request_counter += 1;
        let request_id = LiveId::from_num(0, self.request_counter);

        let url = self.layer.tile_url(&coord, self.hidpi);
        let mut request = HttpRequest::new(url, HttpMethod::GET);
        request.set_header("User-Agent".to_string(), "MakepadMapPicker/0.1".to_string());
        cx.http_request(request_id, request);

        self.tiles.insert(coord, TileState::Loading);
        self.pending_requests.insert(request_id, coord);
    }

    pub fn get_tile(&self, coord: &TileCoord) -> Option<&Texture> {
        if let Some(TileState::Loaded(texture)) = self.tiles.get(coord) {
            Some(texture)
        } else {
            None
        }
    }

    /// Closest loaded ancestor of a tile, with the UV window it covers
    pub fn parent_fallback(&self, coord: &TileCoord) -> Option<(&Texture, Vec2, Vec2)> {
        let mut parent = *coord;
        for _ in 0..4 {
            parent = parent.parent()?;
            if let Some(texture) = self.get_tile(&parent) {
                let zoom_diff = coord.z - parent.z;
                let scale = 1.0 / (1u32 << zoom_diff) as f32;
                let offset_x = ((coord.x % (1 << zoom_diff)) as f32) * scale;
                let offset_y = ((coord.y % (1 << zoom_diff)) as f32) * scale;
                return Some((texture, Vec2 { x: offset_x, y: offset_y }, Vec2 { x: scale, y: scale }));
            }
        }
        None
    }

    /// Handle HTTP response for tile loading, true when a tile became ready
    pub fn handle_response(&mut self, cx: &mut Cx, request_id: LiveId, response: &HttpResponse) -> bool {
        let Some(coord) = self.pending_requests.remove(&request_id) else {
            return false;
        };
        if response.status_code != 200 {
            self.tiles.insert(coord, TileState::Error(format!("HTTP {}", response.status_code)));
            return false;
        }
        let Some(body) = &response.body else {
            self.tiles.insert(coord, TileState::Error("Empty response body".to_string()));
            return false;
        };
        match ImageBuffer::from_png(body).or_else(|_| ImageBuffer::from_jpg(body)) {
            Ok(buffer) => {
                let texture: Texture = buffer.into_new_texture(cx);
                self.tiles.insert(coord, TileState::Loaded(texture));
                true
            }
            Err(e) => {
                log!("tile {:?} failed to decode: {:?}", coord, e);
                self.tiles.insert(coord, TileState::Error(format!("decode error: {:?}", e)));
                false
            }
        }
    }

    pub fn handle_error(&mut self, request_id: LiveId, error: &HttpError) {
        if let Some(coord) = self.pending_requests.remove(&request_id) {
            self.tiles.insert(coord, TileState::Error(format!("{:?}", error)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(url: &str, tile_size: u32, zoom_offset: i32) -> TileLayer {
        let config = MapPickerConfig {
            tiles_url: url.to_string(),
            tile_size,
            zoom_offset,
            ..Default::default()
        };
        TileLayer::from_config(&config)
    }

    #[test]
    fn expands_url_template() {
        let layer = layer("https://{s}.tiles.test/{z}/{x}/{y}{r}.png", 256, 0);
        let coord = TileCoord { x: 4, y: 7, z: 5 };
        assert_eq!(layer.tile_url(&coord, false), "https://c.tiles.test/5/4/7.png");
        assert_eq!(layer.tile_url(&coord, true), "https://c.tiles.test/5/4/7@2x.png");
    }

    #[test]
    fn zoom_offset_shifts_requested_level() {
        assert_eq!(layer("{z}", 512, -1).tile_zoom(15.4), 14);
        assert_eq!(layer("{z}", 256, 0).tile_zoom(0.5), 0);
        assert_eq!(layer("{z}", 512, -1).tile_zoom(0.0), 0);
    }

    #[test]
    fn large_tiles_cover_the_same_ground() {
        let center = Coordinate::new(0.0, 0.0);
        let small = layer("{z}", 256, 0).visible_tiles(&center, 3.0, (256.0, 256.0));
        let large = layer("{z}", 512, -1).visible_tiles(&center, 3.0, (256.0, 256.0));
        assert_eq!(small[0].size, 256.0);
        assert_eq!(large[0].size, 512.0);
        assert!(small.iter().all(|t| t.coord.z == 3));
        assert!(large.iter().all(|t| t.coord.z == 2));
    }

    #[test]
    fn center_tile_sits_under_viewport_center() {
        let tiles = layer("{z}", 256, 0).visible_tiles(&Coordinate::new(0.0, 0.0), 1.0, (512.0, 512.0));
        let hit = tiles
            .iter()
            .find(|t| t.x <= 256.0 && t.x + t.size > 256.0 && t.y <= 256.0 && t.y + t.size > 256.0)
            .unwrap();
        assert_eq!((hit.coord.x, hit.coord.y), (1, 1));
    }
}
