pub mod geometry;
pub mod gfxinfo;
pub mod raw;
pub mod window;
