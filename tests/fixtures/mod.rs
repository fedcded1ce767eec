//! Reusable test fixtures.

mod server_client;

pub use server_client::{
    CLIENT_ADDRESS, SERVER_ADDRESS, ServerClientFixture, open_response, raw_prepare, send_raw,
};
