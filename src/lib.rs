//! Playback speed and seek controls for every video in a host document,
//! with a draggable speed badge and hold-to-activate fast-forward and
//! slow-motion.

pub mod constants;
pub mod feature;
pub mod geometry;
pub mod hold;
pub mod host;
pub mod logging;
pub mod overlay;
pub mod playback;
pub mod scenario;
pub mod settings;
pub mod sim;
pub mod store;
