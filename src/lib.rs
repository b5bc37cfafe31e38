//! h2probe - HTTP/2 client protocol engine for conformance testing
//!
//! This crate drives HTTP/2 connections at the frame level so that test
//! code can send exactly the frames it wants and assert on exactly the
//! frames a server sends back.

pub mod h2;
pub mod session;
pub mod tls;
