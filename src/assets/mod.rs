pub mod cache;
pub mod mesh;
pub mod texture;

pub use cache::AssetCache;
pub use mesh::{MeshData, MeshPlacement};
pub use texture::{TextureData, TextureError};
