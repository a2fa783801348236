//! The control plane's external surface (§4.6). No GUI lives here — the
//! egui dashboards are explicitly out of scope (§1 Non-goals).
pub mod control_plane;
