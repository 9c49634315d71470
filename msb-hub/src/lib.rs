//! # msb-hub
//!
//! The scrobble fan-out service: N sources in, M clients out, with
//! deduplication, normalization, retry and user-definable mutation between
//! them. Plays travel `source -> discovery dedup -> event bus -> client
//! queue -> existing-scrobble check -> scrobble attempt -> dead-letter
//! retry`.

pub mod clients;
pub mod creds;
pub mod lifecycle;
pub mod server;
pub mod sources;
pub mod supervisor;
