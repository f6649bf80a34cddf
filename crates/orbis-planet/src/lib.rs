//! The globe: imagery layers, the color and picking passes, and the
//! [`Planet`] renderable that drives the quadtree every frame.

mod error;
mod layer;
mod picking;
mod planet;
mod render;

pub use error::PlanetError;
pub use layer::{Layer, LayerRegistry};
pub use orbis_quadtree::FrameState;
pub use picking::{PickResult, PickingPass, decode_pick_color, encode_pick_color};
pub use planet::{FrameRenderable, FrameStats, Planet};
pub use render::RenderPassOrchestrator;
