//! Orbis globe viewer: window, orbit camera, procedural tile sources and
//! the frame loop around [`orbis_planet::Planet`].

pub mod camera;
pub mod game_loop;
pub mod platform;
pub mod tiles;
pub mod viewer;
