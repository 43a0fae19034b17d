// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf message definitions for the three wire services.
//!
//! The messages are hand-derived with `prost` rather than generated from
//! `.proto` files so the build needs no protoc toolchain; the wire encoding
//! is standard protobuf. Each service has a `RpcRequest`/`RpcResponse`
//! envelope whose oneof discriminates the operation, mirroring how streams
//! are dispatched server-side.

/// Error payload carried in RPC responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    /// Present (with a reason) while the service is still starting up.
    #[prost(string, optional, tag = "1")]
    pub not_ready: Option<String>,
}

/// Verb service: `Ping` and `Call`.
pub mod verb_proto {
    pub use super::{PingRequest, PingResponse, RpcError};

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CallRequest {
        /// `module.verb` reference.
        #[prost(string, tag = "1")]
        pub verb: String,
        #[prost(bytes = "vec", tag = "2")]
        pub body: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CallResponse {
        #[prost(oneof = "call_response::Response", tags = "1, 2")]
        pub response: Option<call_response::Response>,
    }

    pub mod call_response {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Response {
            #[prost(bytes, tag = "1")]
            Body(Vec<u8>),
            #[prost(message, tag = "2")]
            Error(super::RpcError),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcRequest {
        #[prost(oneof = "rpc_request::Request", tags = "1, 2")]
        pub request: Option<rpc_request::Request>,
    }

    pub mod rpc_request {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Request {
            #[prost(message, tag = "1")]
            Ping(super::PingRequest),
            #[prost(message, tag = "2")]
            Call(super::CallRequest),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcResponse {
        #[prost(oneof = "rpc_response::Response", tags = "1, 2")]
        pub response: Option<rpc_response::Response>,
    }

    pub mod rpc_response {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Response {
            #[prost(message, tag = "1")]
            Ping(super::PingResponse),
            #[prost(message, tag = "2")]
            Call(super::CallResponse),
        }
    }
}

/// Controller service: deployments, artefacts, runners, schema distribution.
pub mod controller_proto {
    pub use super::{PingRequest, PingResponse, RpcError};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum DeploymentChangeType {
        DeploymentAdded = 0,
        DeploymentChanged = 1,
        DeploymentRemoved = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum RunnerState {
        Idle = 0,
        Reserved = 1,
        Assigned = 2,
        Dead = 3,
    }

    /// Metadata of one artefact within a deployment.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DeploymentArtefact {
        /// Hex-encoded SHA-256 of the content.
        #[prost(string, tag = "1")]
        pub digest: String,
        /// Module-relative path.
        #[prost(string, tag = "2")]
        pub path: String,
        #[prost(bool, tag = "3")]
        pub executable: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetArtefactDiffsRequest {
        #[prost(string, repeated, tag = "1")]
        pub client_digests: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetArtefactDiffsResponse {
        /// Digests the client has that the controller is missing.
        #[prost(string, repeated, tag = "1")]
        pub missing_digests: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct UploadArtefactRequest {
        #[prost(bytes = "vec", tag = "1")]
        pub content: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct UploadArtefactResponse {
        #[prost(string, tag = "1")]
        pub digest: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CreateDeploymentRequest {
        /// Module schema, JSON-encoded.
        #[prost(bytes = "vec", tag = "1")]
        pub schema_json: Vec<u8>,
        #[prost(message, repeated, tag = "2")]
        pub artefacts: Vec<DeploymentArtefact>,
        /// Scheduling labels, JSON object.
        #[prost(bytes = "vec", tag = "3")]
        pub labels_json: Vec<u8>,
        /// Language tag of the module toolchain.
        #[prost(string, tag = "4")]
        pub language: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CreateDeploymentResponse {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetDeploymentRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetDeploymentResponse {
        #[prost(bytes = "vec", tag = "1")]
        pub schema_json: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetDeploymentArtefactsRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
        /// Artefacts the caller already holds, elided from the stream.
        #[prost(message, repeated, tag = "2")]
        pub have_artefacts: Vec<DeploymentArtefact>,
    }

    /// One chunk of a streamed artefact download. Chunks of a single artefact
    /// are contiguous and at most 1 MiB each.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetDeploymentArtefactsResponse {
        #[prost(message, optional, tag = "1")]
        pub artefact: Option<DeploymentArtefact>,
        #[prost(bytes = "vec", tag = "2")]
        pub chunk: Vec<u8>,
    }

    /// Heartbeat sent every 10s on the runner registration stream.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RegisterRunnerRequest {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub endpoint: String,
        #[prost(enumeration = "RunnerState", tag = "3")]
        pub state: i32,
        #[prost(string, optional, tag = "4")]
        pub deployment_key: Option<String>,
        #[prost(bytes = "vec", tag = "5")]
        pub labels_json: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RegisterRunnerResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct UpdateDeployRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
        #[prost(int32, tag = "2")]
        pub min_replicas: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct UpdateDeployResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReplaceDeployRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
        #[prost(int32, tag = "2")]
        pub min_replicas: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReplaceDeployResponse {}

    /// One log entry on the deployment log client-stream.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StreamDeploymentLogsRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
        /// Milliseconds since the Unix epoch.
        #[prost(int64, tag = "2")]
        pub time_ms: i64,
        #[prost(int32, tag = "3")]
        pub log_level: i32,
        #[prost(map = "string, string", tag = "4")]
        pub attributes: std::collections::HashMap<String, String>,
        #[prost(string, tag = "5")]
        pub message: String,
        #[prost(string, optional, tag = "6")]
        pub error: Option<String>,
        #[prost(string, optional, tag = "7")]
        pub request_key: Option<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StreamDeploymentLogsResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetSchemaRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetSchemaResponse {
        /// Whole schema (all active modules), JSON-encoded.
        #[prost(bytes = "vec", tag = "1")]
        pub schema_json: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PullSchemaRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PullSchemaResponse {
        #[prost(string, tag = "1")]
        pub module_name: String,
        #[prost(string, tag = "2")]
        pub deployment_key: String,
        /// Empty for removals.
        #[prost(bytes = "vec", tag = "3")]
        pub schema_json: Vec<u8>,
        #[prost(enumeration = "DeploymentChangeType", tag = "4")]
        pub change_type: i32,
        /// True while the initial burst of known modules is still streaming.
        #[prost(bool, tag = "5")]
        pub more: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusController {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub endpoint: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusRunner {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub endpoint: String,
        #[prost(enumeration = "RunnerState", tag = "3")]
        pub state: i32,
        #[prost(string, optional, tag = "4")]
        pub deployment_key: Option<String>,
        #[prost(bytes = "vec", tag = "5")]
        pub labels_json: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusDeployment {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub module_name: String,
        #[prost(int32, tag = "3")]
        pub min_replicas: i32,
        #[prost(bytes = "vec", tag = "4")]
        pub labels_json: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusIngressRoute {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
        #[prost(string, tag = "2")]
        pub verb: String,
        #[prost(string, tag = "3")]
        pub method: String,
        #[prost(string, tag = "4")]
        pub path: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusResponse {
        #[prost(message, repeated, tag = "1")]
        pub controllers: Vec<StatusController>,
        #[prost(message, repeated, tag = "2")]
        pub runners: Vec<StatusRunner>,
        #[prost(message, repeated, tag = "3")]
        pub deployments: Vec<StatusDeployment>,
        #[prost(message, repeated, tag = "4")]
        pub ingress_routes: Vec<StatusIngressRoute>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProcessListRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProcessListRunner {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub endpoint: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProcessListEntry {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
        #[prost(int32, tag = "2")]
        pub min_replicas: i32,
        #[prost(message, optional, tag = "3")]
        pub runner: Option<ProcessListRunner>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProcessListResponse {
        #[prost(message, repeated, tag = "1")]
        pub processes: Vec<ProcessListEntry>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcRequest {
        #[prost(
            oneof = "rpc_request::Request",
            tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14"
        )]
        pub request: Option<rpc_request::Request>,
    }

    pub mod rpc_request {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Request {
            #[prost(message, tag = "1")]
            Ping(super::PingRequest),
            #[prost(message, tag = "2")]
            ProcessList(super::ProcessListRequest),
            #[prost(message, tag = "3")]
            Status(super::StatusRequest),
            #[prost(message, tag = "4")]
            GetArtefactDiffs(super::GetArtefactDiffsRequest),
            #[prost(message, tag = "5")]
            UploadArtefact(super::UploadArtefactRequest),
            #[prost(message, tag = "6")]
            CreateDeployment(super::CreateDeploymentRequest),
            #[prost(message, tag = "7")]
            GetDeployment(super::GetDeploymentRequest),
            #[prost(message, tag = "8")]
            GetDeploymentArtefacts(super::GetDeploymentArtefactsRequest),
            #[prost(message, tag = "9")]
            RegisterRunner(super::RegisterRunnerRequest),
            #[prost(message, tag = "10")]
            UpdateDeploy(super::UpdateDeployRequest),
            #[prost(message, tag = "11")]
            ReplaceDeploy(super::ReplaceDeployRequest),
            #[prost(message, tag = "12")]
            DeploymentLog(super::StreamDeploymentLogsRequest),
            #[prost(message, tag = "13")]
            GetSchema(super::GetSchemaRequest),
            #[prost(message, tag = "14")]
            PullSchema(super::PullSchemaRequest),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcResponse {
        #[prost(
            oneof = "rpc_response::Response",
            tags = "1, 2, 3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 15"
        )]
        pub response: Option<rpc_response::Response>,
    }

    pub mod rpc_response {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Response {
            #[prost(message, tag = "1")]
            Ping(super::PingResponse),
            #[prost(message, tag = "2")]
            ProcessList(super::ProcessListResponse),
            #[prost(message, tag = "3")]
            Status(super::StatusResponse),
            #[prost(message, tag = "4")]
            GetArtefactDiffs(super::GetArtefactDiffsResponse),
            #[prost(message, tag = "5")]
            UploadArtefact(super::UploadArtefactResponse),
            #[prost(message, tag = "6")]
            CreateDeployment(super::CreateDeploymentResponse),
            #[prost(message, tag = "7")]
            GetDeployment(super::GetDeploymentResponse),
            #[prost(message, tag = "9")]
            RegisterRunner(super::RegisterRunnerResponse),
            #[prost(message, tag = "10")]
            UpdateDeploy(super::UpdateDeployResponse),
            #[prost(message, tag = "11")]
            ReplaceDeploy(super::ReplaceDeployResponse),
            #[prost(message, tag = "12")]
            DeploymentLog(super::StreamDeploymentLogsResponse),
            #[prost(message, tag = "13")]
            GetSchema(super::GetSchemaResponse),
            #[prost(message, tag = "15")]
            Error(super::RpcError),
        }
    }
}

/// Runner service: controller → runner control channel.
pub mod runner_proto {
    pub use super::{PingRequest, PingResponse, RpcError};

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReserveRequest {
        #[prost(uint64, tag = "1")]
        pub reservation_timeout_ms: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReserveResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DeployRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DeployResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TerminateRequest {
        #[prost(string, tag = "1")]
        pub deployment_key: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TerminateResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcRequest {
        #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4")]
        pub request: Option<rpc_request::Request>,
    }

    pub mod rpc_request {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Request {
            #[prost(message, tag = "1")]
            Ping(super::PingRequest),
            #[prost(message, tag = "2")]
            Reserve(super::ReserveRequest),
            #[prost(message, tag = "3")]
            Deploy(super::DeployRequest),
            #[prost(message, tag = "4")]
            Terminate(super::TerminateRequest),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcResponse {
        #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5")]
        pub response: Option<rpc_response::Response>,
    }

    pub mod rpc_response {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Response {
            #[prost(message, tag = "1")]
            Ping(super::PingResponse),
            #[prost(message, tag = "2")]
            Reserve(super::ReserveResponse),
            #[prost(message, tag = "3")]
            Deploy(super::DeployResponse),
            #[prost(message, tag = "4")]
            Terminate(super::TerminateResponse),
            #[prost(message, tag = "5")]
            Error(super::RpcError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::controller_proto::*;
    use prost::Message;

    #[test]
    fn envelope_round_trip() {
        let request = RpcRequest {
            request: Some(rpc_request::Request::CreateDeployment(
                CreateDeploymentRequest {
                    schema_json: b"{}".to_vec(),
                    artefacts: vec![DeploymentArtefact {
                        digest: "ab".repeat(32),
                        path: "bin/main".to_string(),
                        executable: true,
                    }],
                    labels_json: b"{}".to_vec(),
                    language: "rust".to_string(),
                },
            )),
        };
        let bytes = request.encode_to_vec();
        let decoded = RpcRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn change_type_values_are_stable() {
        assert_eq!(DeploymentChangeType::DeploymentAdded as i32, 0);
        assert_eq!(DeploymentChangeType::DeploymentChanged as i32, 1);
        assert_eq!(DeploymentChangeType::DeploymentRemoved as i32, 2);
    }

    #[test]
    fn pull_schema_defaults() {
        let msg = PullSchemaResponse::default();
        assert_eq!(msg.change_type, DeploymentChangeType::DeploymentAdded as i32);
        assert!(!msg.more);
        assert!(msg.schema_json.is_empty());
    }
}
