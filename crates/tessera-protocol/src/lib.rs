// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Protocol - QUIC + Protobuf communication layer
//!
//! This crate provides the wire protocol for communication between:
//! - The build engine / CLI and the controller (controller protocol)
//! - The controller and runners (runner protocol)
//! - Anything and a deployed verb (verb protocol)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    tessera-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: Request/Response + Server/Client Streaming      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Server streams (`PullSchema`, `GetDeploymentArtefacts`) are sequences of
//! `StreamData` frames; `PullSchema` never ends, artefact downloads finish
//! with `StreamEnd`. Client streams (`RegisterRunner`, deployment logs) are
//! repeated request frames on one stream.

pub mod client;
pub mod frame;
pub mod proto;
pub mod server;
pub mod services;

pub use client::{
    ClientError, StreamBackoff, TesseraClient, TesseraClientConfig, retry_server_stream,
};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use proto::{PingRequest, PingResponse, RpcError, controller_proto, runner_proto, verb_proto};
pub use server::{ServerError, StreamHandler, TesseraServer, TesseraServerConfig};
pub use services::{ClientStream, ControllerClient, RunnerClient, VerbClient};
