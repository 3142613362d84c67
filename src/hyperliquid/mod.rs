// =============================================================================
// Hyperliquid upstream — WebSocket session + info REST client
// =============================================================================

pub mod client;
pub mod ws;

pub use client::HyperliquidClient;
