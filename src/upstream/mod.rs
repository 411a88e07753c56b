// Upstream model catalog — metadata lookups, authenticated downloads, and the
// filename/path policy applied to everything written under the library root.

pub mod client;
pub mod paths;
pub mod time;
pub mod types;
