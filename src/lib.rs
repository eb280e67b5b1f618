// StationCast Server Library
// Per-station pipeline supervision shared by the HTTP server and tests

pub mod models;
pub mod services;
