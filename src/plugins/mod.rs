pub mod api;
pub mod plex;
pub mod registry;
