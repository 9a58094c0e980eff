// Inbound request attributes as forwarded by the reverse proxy.
pub mod intake;
