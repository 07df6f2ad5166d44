//! Listeners: raw TCP, WebSocket, and the HTTP RPC surface

pub mod rpc;
pub mod tcp;
pub mod websocket;

pub use rpc::routes as rpc_routes;
pub use tcp::handle_tcp_client;
pub use websocket::{handle_ws_client, ws_route};
