// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC surface: the controller service and the verb service.
//!
//! Each QUIC stream carries one exchange. Most operations are single
//! request/response; `PullSchema` and `GetDeploymentArtefacts` are server
//! streams, `RegisterRunner` and `StreamDeploymentLogs` are client streams
//! (repeated request frames on one stream).

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use tessera_protocol::frame::MessageType;
use tessera_protocol::proto::controller_proto::{self, rpc_request, rpc_response};
use tessera_protocol::proto::verb_proto;
use tessera_protocol::{RpcError, ServerError, StreamHandler, TesseraServer, VerbClient};
use tessera_schema::{Decl, Module, Schema};

use crate::bus::{ChangeType, SchemaBus};
use crate::clients::ClientCache;
use crate::dal::Dal;
use crate::error::{DalError, DalResult};

/// Artefact download chunk size (1 MiB).
const ARTEFACT_CHUNK_SIZE: i64 = 1024 * 1024;

/// Shared state of the controller service handlers.
pub struct ControllerService {
    pub dal: Dal,
    pub bus: Arc<SchemaBus>,
}

impl ControllerService {
    pub fn new(dal: Dal, bus: Arc<SchemaBus>) -> Self {
        Self { dal, bus }
    }
}

fn decode_digests(digests: &[String]) -> DalResult<Vec<Vec<u8>>> {
    digests
        .iter()
        .map(|d| {
            hex::decode(d).map_err(|_| DalError::Constraint(format!("malformed digest {d:?}")))
        })
        .collect()
}

fn rpc_error(err: &DalError) -> RpcError {
    let code = if err.is_not_found() {
        "NOT_FOUND"
    } else if err.is_conflict() {
        "CONFLICT"
    } else if err.is_constraint() {
        "CONSTRAINT_VIOLATION"
    } else {
        "INTERNAL"
    };
    RpcError {
        code: code.to_string(),
        message: err.to_string(),
    }
}

fn envelope(response: rpc_response::Response) -> controller_proto::RpcResponse {
    controller_proto::RpcResponse {
        response: Some(response),
    }
}

/// Run the controller QUIC service until the endpoint closes.
pub async fn run_controller_server(
    bind: SocketAddr,
    state: Arc<ControllerService>,
) -> Result<(), ServerError> {
    let server = TesseraServer::dev(bind)?;
    info!(addr = %server.local_addr()?, "controller service listening");
    server
        .run(move |stream| {
            let state = state.clone();
            async move {
                if let Err(e) = handle_controller_stream(state, stream).await {
                    match e {
                        ServerError::Frame(tessera_protocol::FrameError::ConnectionClosed) => {}
                        e => debug!(error = %e, "controller stream ended with error"),
                    }
                }
            }
        })
        .await
}

async fn handle_controller_stream(
    state: Arc<ControllerService>,
    mut stream: StreamHandler,
) -> Result<(), ServerError> {
    let frame = stream.read_frame().await?;
    if frame.message_type != MessageType::Request {
        return Ok(());
    }
    let request: controller_proto::RpcRequest = frame.decode().map_err(ServerError::Frame)?;
    let Some(request) = request.request else {
        return Ok(());
    };

    match request {
        rpc_request::Request::Ping(_) => {
            stream
                .respond(&envelope(rpc_response::Response::Ping(
                    controller_proto::PingResponse { not_ready: None },
                )))
                .await
        }
        rpc_request::Request::GetSchema(_) => {
            respond_dal(&mut stream, state.get_schema().await).await
        }
        rpc_request::Request::GetArtefactDiffs(req) => {
            respond_dal(&mut stream, state.get_artefact_diffs(req).await).await
        }
        rpc_request::Request::UploadArtefact(req) => {
            respond_dal(&mut stream, state.upload_artefact(req).await).await
        }
        rpc_request::Request::CreateDeployment(req) => {
            respond_dal(&mut stream, state.create_deployment(req).await).await
        }
        rpc_request::Request::GetDeployment(req) => {
            respond_dal(&mut stream, state.get_deployment(req).await).await
        }
        rpc_request::Request::UpdateDeploy(req) => {
            respond_dal(&mut stream, state.update_deploy(req).await).await
        }
        rpc_request::Request::ReplaceDeploy(req) => {
            respond_dal(&mut stream, state.replace_deploy(req).await).await
        }
        rpc_request::Request::Status(_) => respond_dal(&mut stream, state.status().await).await,
        rpc_request::Request::ProcessList(_) => {
            respond_dal(&mut stream, state.process_list().await).await
        }
        rpc_request::Request::GetDeploymentArtefacts(req) => {
            state.stream_artefacts(&mut stream, req).await
        }
        rpc_request::Request::PullSchema(_) => state.pull_schema(&mut stream).await,
        rpc_request::Request::RegisterRunner(first) => {
            state.runner_heartbeats(&mut stream, first).await
        }
        rpc_request::Request::DeploymentLog(first) => {
            state.deployment_logs(&mut stream, first).await
        }
    }
}

async fn respond_dal(
    stream: &mut StreamHandler,
    result: DalResult<rpc_response::Response>,
) -> Result<(), ServerError> {
    match result {
        Ok(response) => stream.respond(&envelope(response)).await,
        Err(e) => {
            debug!(error = %e, "controller operation failed");
            stream
                .respond(&envelope(rpc_response::Response::Error(rpc_error(&e))))
                .await
        }
    }
}

impl ControllerService {
    async fn get_schema(&self) -> DalResult<rpc_response::Response> {
        let deployments = self.dal.get_deployments(true).await?;
        let schema = Schema {
            modules: deployments.into_iter().map(|d| d.schema).collect(),
        };
        let schema_json = serde_json::to_vec(&schema)
            .map_err(|e| DalError::Constraint(format!("unserializable schema: {e}")))?;
        Ok(rpc_response::Response::GetSchema(
            controller_proto::GetSchemaResponse { schema_json },
        ))
    }

    async fn get_artefact_diffs(
        &self,
        req: controller_proto::GetArtefactDiffsRequest,
    ) -> DalResult<rpc_response::Response> {
        let digests = decode_digests(&req.client_digests)?;
        let missing = self.dal.get_artefact_diffs(&digests).await?;
        Ok(rpc_response::Response::GetArtefactDiffs(
            controller_proto::GetArtefactDiffsResponse {
                missing_digests: missing.iter().map(hex::encode).collect(),
            },
        ))
    }

    async fn upload_artefact(
        &self,
        req: controller_proto::UploadArtefactRequest,
    ) -> DalResult<rpc_response::Response> {
        let digest = self.dal.create_artefact(&req.content).await?;
        Ok(rpc_response::Response::UploadArtefact(
            controller_proto::UploadArtefactResponse {
                digest: hex::encode(digest),
            },
        ))
    }

    async fn create_deployment(
        &self,
        req: controller_proto::CreateDeploymentRequest,
    ) -> DalResult<rpc_response::Response> {
        let module: Module = serde_json::from_slice(&req.schema_json)
            .map_err(|e| DalError::Constraint(format!("unparseable module schema: {e}")))?;
        let labels: serde_json::Value = if req.labels_json.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_slice(&req.labels_json)
                .map_err(|e| DalError::Constraint(format!("unparseable labels: {e}")))?
        };
        let artefacts = req
            .artefacts
            .iter()
            .map(|a| {
                let digest = hex::decode(&a.digest)
                    .map_err(|_| DalError::Constraint(format!("malformed digest {:?}", a.digest)))?;
                Ok((digest, a.path.clone(), a.executable))
            })
            .collect::<DalResult<Vec<_>>>()?;

        let key = self
            .dal
            .create_deployment(&req.language, &module, &artefacts, labels)
            .await?;
        Ok(rpc_response::Response::CreateDeployment(
            controller_proto::CreateDeploymentResponse {
                deployment_key: key.to_string(),
            },
        ))
    }

    async fn get_deployment(
        &self,
        req: controller_proto::GetDeploymentRequest,
    ) -> DalResult<rpc_response::Response> {
        let deployment = self.dal.get_deployment(&req.deployment_key).await?;
        let schema_json = serde_json::to_vec(&deployment.schema)
            .map_err(|e| DalError::Constraint(format!("unserializable schema: {e}")))?;
        Ok(rpc_response::Response::GetDeployment(
            controller_proto::GetDeploymentResponse { schema_json },
        ))
    }

    async fn update_deploy(
        &self,
        req: controller_proto::UpdateDeployRequest,
    ) -> DalResult<rpc_response::Response> {
        self.dal
            .set_deployment_replicas(&req.deployment_key, req.min_replicas)
            .await?;
        Ok(rpc_response::Response::UpdateDeploy(
            controller_proto::UpdateDeployResponse {},
        ))
    }

    /// Activate a deployment, draining whichever deployment of the same
    /// module is currently active.
    async fn replace_deploy(
        &self,
        req: controller_proto::ReplaceDeployRequest,
    ) -> DalResult<rpc_response::Response> {
        let new = self.dal.get_deployment(&req.deployment_key).await?;
        let active = self
            .dal
            .get_active_deployment_for_module(&new.module_name)
            .await?;
        match active {
            Some(old) if old.key != new.key => {
                self.dal
                    .replace_deployment(&old.key, &new.key, req.min_replicas)
                    .await?;
            }
            _ => {
                self.dal
                    .set_deployment_replicas(&new.key, req.min_replicas)
                    .await?;
            }
        }
        self.register_module_resources(&new.key, &new.schema).await?;
        Ok(rpc_response::Response::ReplaceDeploy(
            controller_proto::ReplaceDeployResponse {},
        ))
    }

    /// Register topics, subscriptions, subscribers and ingress routes a
    /// freshly activated deployment declares.
    async fn register_module_resources(&self, key: &str, module: &Module) -> DalResult<()> {
        self.dal.create_pubsub_for_module(module).await?;
        self.dal
            .create_subscribers_for_deployment(key, module)
            .await?;
        for decl in &module.decls {
            if let Decl::Verb(verb) = decl
                && let Some(ingress) = &verb.ingress
            {
                self.dal
                    .create_ingress_route(key, &ingress.method, &ingress.path, &module.name, &verb.name)
                    .await?;
            }
        }
        Ok(())
    }

    async fn status(&self) -> DalResult<rpc_response::Response> {
        let controllers = self.dal.get_live_controllers().await?;
        let runners = self.dal.get_active_runners().await?;
        let deployments = self.dal.get_deployments(false).await?;
        let routes = self.dal.get_active_ingress_routes().await?;

        Ok(rpc_response::Response::Status(
            controller_proto::StatusResponse {
                controllers: controllers
                    .into_iter()
                    .map(|c| controller_proto::StatusController {
                        key: c.key,
                        endpoint: c.endpoint,
                    })
                    .collect(),
                runners: runners
                    .into_iter()
                    .map(|r| controller_proto::StatusRunner {
                        key: r.key,
                        endpoint: r.endpoint,
                        state: runner_state_proto(r.state) as i32,
                        deployment_key: r.deployment_key,
                        labels_json: r.labels.to_string().into_bytes(),
                    })
                    .collect(),
                deployments: deployments
                    .into_iter()
                    .map(|d| controller_proto::StatusDeployment {
                        key: d.key,
                        module_name: d.module_name,
                        min_replicas: d.min_replicas,
                        labels_json: d.labels.to_string().into_bytes(),
                    })
                    .collect(),
                ingress_routes: routes
                    .into_iter()
                    .map(|r| controller_proto::StatusIngressRoute {
                        deployment_key: r.deployment_key,
                        verb: r.verb,
                        method: r.method,
                        path: r.path,
                    })
                    .collect(),
            },
        ))
    }

    async fn process_list(&self) -> DalResult<rpc_response::Response> {
        let deployments = self.dal.get_deployments(true).await?;
        let mut processes = Vec::new();
        for deployment in deployments {
            let runners = self.dal.get_runners_for_deployment(&deployment.key).await?;
            if runners.is_empty() {
                processes.push(controller_proto::ProcessListEntry {
                    deployment_key: deployment.key.clone(),
                    min_replicas: deployment.min_replicas,
                    runner: None,
                });
            }
            for runner in runners {
                processes.push(controller_proto::ProcessListEntry {
                    deployment_key: deployment.key.clone(),
                    min_replicas: deployment.min_replicas,
                    runner: Some(controller_proto::ProcessListRunner {
                        key: runner.key,
                        endpoint: runner.endpoint,
                    }),
                });
            }
        }
        Ok(rpc_response::Response::ProcessList(
            controller_proto::ProcessListResponse { processes },
        ))
    }

    /// Stream a deployment's artefacts in ≤1 MiB chunks. Chunks of one
    /// artefact are contiguous; concatenated they equal the uploaded bytes.
    async fn stream_artefacts(
        &self,
        stream: &mut StreamHandler,
        req: controller_proto::GetDeploymentArtefactsRequest,
    ) -> Result<(), ServerError> {
        let have: Vec<String> = req
            .have_artefacts
            .iter()
            .map(|a| a.digest.clone())
            .collect();
        let artefacts = match self.dal.get_deployment_artefacts(&req.deployment_key).await {
            Ok(artefacts) => artefacts,
            Err(e) => {
                return stream
                    .respond(&envelope(rpc_response::Response::Error(rpc_error(&e))))
                    .await;
            }
        };

        for artefact in artefacts {
            let digest = hex::encode(&artefact.digest);
            if have.contains(&digest) {
                continue;
            }
            let meta = controller_proto::DeploymentArtefact {
                digest: digest.clone(),
                path: artefact.path.clone(),
                executable: artefact.executable,
            };
            let mut offset = 0i64;
            loop {
                let chunk = match self
                    .dal
                    .get_artefact_content_range(artefact.id, offset, ARTEFACT_CHUNK_SIZE)
                    .await
                {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!(digest = %digest, error = %e, "artefact read failed mid-stream");
                        return Err(ServerError::Frame(
                            tessera_protocol::FrameError::Io(std::io::Error::other(e.to_string())),
                        ));
                    }
                };
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as i64;
                stream
                    .send_stream_item(&controller_proto::GetDeploymentArtefactsResponse {
                        artefact: Some(meta.clone()),
                        chunk,
                    })
                    .await?;
            }
        }
        stream.end_stream().await?;
        stream.finish()?;
        Ok(())
    }

    /// The long-lived schema stream: all active deployments first (`more`
    /// set until the last), then changes as they happen. Blocks when there
    /// are no deployments. A slow consumer backpressures the bus rather
    /// than missing changes.
    async fn pull_schema(&self, stream: &mut StreamHandler) -> Result<(), ServerError> {
        // Subscribe before the initial burst so no change is lost between.
        let mut changes = self.bus.subscribe().await;

        let deployments = match self.dal.get_deployments(true).await {
            Ok(deployments) => deployments,
            Err(e) => {
                return stream
                    .respond(&envelope(rpc_response::Response::Error(rpc_error(&e))))
                    .await;
            }
        };
        let count = deployments.len();
        for (i, deployment) in deployments.into_iter().enumerate() {
            let schema_json = serde_json::to_vec(&deployment.schema).unwrap_or_default();
            stream
                .send_stream_item(&controller_proto::PullSchemaResponse {
                    module_name: deployment.module_name,
                    deployment_key: deployment.key,
                    schema_json,
                    change_type: controller_proto::DeploymentChangeType::DeploymentAdded as i32,
                    more: i + 1 < count,
                })
                .await?;
        }

        loop {
            // `None` means the bus shut down.
            let Some(change) = changes.recv().await else {
                return Ok(());
            };
            let schema_json = change
                .schema
                .as_ref()
                .map(|m| serde_json::to_vec(m).unwrap_or_default())
                .unwrap_or_default();
            let change_type = match change.change {
                ChangeType::Added => controller_proto::DeploymentChangeType::DeploymentAdded,
                ChangeType::Changed => controller_proto::DeploymentChangeType::DeploymentChanged,
                ChangeType::Removed => controller_proto::DeploymentChangeType::DeploymentRemoved,
            };
            stream
                .send_stream_item(&controller_proto::PullSchemaResponse {
                    module_name: change.module_name,
                    deployment_key: change.deployment_key,
                    schema_json,
                    change_type: change_type as i32,
                    more: false,
                })
                .await?;
        }
    }

    /// Consume runner heartbeats until the stream closes.
    async fn runner_heartbeats(
        &self,
        stream: &mut StreamHandler,
        first: controller_proto::RegisterRunnerRequest,
    ) -> Result<(), ServerError> {
        self.apply_heartbeat(first).await;
        loop {
            let frame = match stream.read_frame().await {
                Ok(frame) => frame,
                Err(_) => return Ok(()),
            };
            if frame.message_type != MessageType::Request {
                continue;
            }
            let Ok(controller_proto::RpcRequest {
                request: Some(rpc_request::Request::RegisterRunner(heartbeat)),
            }) = frame.decode()
            else {
                continue;
            };
            self.apply_heartbeat(heartbeat).await;
        }
    }

    async fn apply_heartbeat(&self, heartbeat: controller_proto::RegisterRunnerRequest) {
        let state = match controller_proto::RunnerState::try_from(heartbeat.state) {
            Ok(controller_proto::RunnerState::Idle) => crate::dal::RunnerState::Idle,
            Ok(controller_proto::RunnerState::Reserved) => crate::dal::RunnerState::Reserved,
            Ok(controller_proto::RunnerState::Assigned) => crate::dal::RunnerState::Assigned,
            Ok(controller_proto::RunnerState::Dead) => crate::dal::RunnerState::Dead,
            Err(_) => {
                warn!(runner = %heartbeat.key, state = heartbeat.state, "unknown runner state");
                return;
            }
        };
        let labels = serde_json::from_slice(&heartbeat.labels_json)
            .unwrap_or_else(|_| serde_json::json!({}));
        if let Err(e) = self
            .dal
            .upsert_runner(
                &heartbeat.key,
                &heartbeat.endpoint,
                state,
                labels,
                heartbeat.deployment_key.as_deref(),
            )
            .await
        {
            warn!(runner = %heartbeat.key, error = %e, "runner heartbeat rejected");
        }
    }

    /// Consume deployment log entries until the stream closes.
    async fn deployment_logs(
        &self,
        stream: &mut StreamHandler,
        first: controller_proto::StreamDeploymentLogsRequest,
    ) -> Result<(), ServerError> {
        self.apply_log(first).await;
        loop {
            let frame = match stream.read_frame().await {
                Ok(frame) => frame,
                Err(_) => return Ok(()),
            };
            if frame.message_type != MessageType::Request {
                continue;
            }
            let Ok(controller_proto::RpcRequest {
                request: Some(rpc_request::Request::DeploymentLog(entry)),
            }) = frame.decode()
            else {
                continue;
            };
            self.apply_log(entry).await;
        }
    }

    async fn apply_log(&self, entry: controller_proto::StreamDeploymentLogsRequest) {
        let payload = serde_json::json!({
            "message": entry.message,
            "attributes": entry.attributes,
            "error": entry.error,
            "time_ms": entry.time_ms,
        });
        if let Err(e) = self
            .dal
            .insert_log_event(
                &entry.deployment_key,
                entry.request_key.as_deref(),
                entry.log_level,
                payload,
            )
            .await
        {
            debug!(deployment = %entry.deployment_key, error = %e, "log entry dropped");
        }
    }
}

fn runner_state_proto(state: crate::dal::RunnerState) -> controller_proto::RunnerState {
    match state {
        crate::dal::RunnerState::Idle => controller_proto::RunnerState::Idle,
        crate::dal::RunnerState::Reserved => controller_proto::RunnerState::Reserved,
        crate::dal::RunnerState::Assigned => controller_proto::RunnerState::Assigned,
        crate::dal::RunnerState::Dead => controller_proto::RunnerState::Dead,
    }
}

/// Shared state of the verb service.
pub struct VerbService {
    pub dal: Dal,
    pub clients: Arc<ClientCache>,
}

impl VerbService {
    pub fn new(dal: Dal, clients: Arc<ClientCache>) -> Self {
        Self { dal, clients }
    }

    /// Route a call to an assigned runner of the verb's module and proxy
    /// the response. Records a call event on the deployment's timeline.
    async fn call(&self, req: verb_proto::CallRequest) -> verb_proto::CallResponse {
        match self.route_call(&req).await {
            Ok(body) => verb_proto::CallResponse {
                response: Some(verb_proto::call_response::Response::Body(body)),
            },
            Err((code, message)) => verb_proto::CallResponse {
                response: Some(verb_proto::call_response::Response::Error(RpcError {
                    code,
                    message,
                })),
            },
        }
    }

    async fn route_call(&self, req: &verb_proto::CallRequest) -> Result<Vec<u8>, (String, String)> {
        let verb: tessera_schema::Ref = req
            .verb
            .parse()
            .map_err(|_| ("INVALID".to_string(), format!("malformed verb {:?}", req.verb)))?;

        let endpoint = self
            .dal
            .get_route_for_module(&verb.module)
            .await
            .map_err(|e| ("INTERNAL".to_string(), e.to_string()))?
            .ok_or_else(|| {
                (
                    "NOT_FOUND".to_string(),
                    format!("{verb}: no assigned runner for module"),
                )
            })?;

        let client = self
            .clients
            .get(&endpoint)
            .await
            .map_err(|e| ("UNAVAILABLE".to_string(), format!("{verb}: {e}")))?;
        let result = VerbClient::new(client)
            .call(req.verb.clone(), req.body.clone())
            .await
            .map_err(|e| ("UNAVAILABLE".to_string(), format!("{verb}: {e}")));

        if let Ok(Some(deployment)) = self.dal.get_active_deployment_for_module(&verb.module).await
        {
            let outcome = serde_json::json!({
                "verb": req.verb,
                "ok": result.is_ok(),
            });
            if let Err(e) = self
                .dal
                .insert_call_event(&deployment.key, None, None, &req.verb, outcome)
                .await
            {
                debug!(error = %e, "call event dropped");
            }
        }

        result
    }
}

/// Run the verb QUIC service until the endpoint closes.
pub async fn run_verb_server(bind: SocketAddr, state: Arc<VerbService>) -> Result<(), ServerError> {
    let server = TesseraServer::dev(bind)?;
    info!(addr = %server.local_addr()?, "verb service listening");
    server
        .run(move |mut stream| {
            let state = state.clone();
            async move {
                let result: Result<(), ServerError> = async {
                    let frame = stream.read_frame().await?;
                    let request: verb_proto::RpcRequest =
                        frame.decode().map_err(ServerError::Frame)?;
                    let response = match request.request {
                        Some(verb_proto::rpc_request::Request::Ping(_)) => {
                            verb_proto::rpc_response::Response::Ping(verb_proto::PingResponse {
                                not_ready: None,
                            })
                        }
                        Some(verb_proto::rpc_request::Request::Call(call)) => {
                            verb_proto::rpc_response::Response::Call(state.call(call).await)
                        }
                        None => return Ok(()),
                    };
                    stream
                        .respond(&verb_proto::RpcResponse {
                            response: Some(response),
                        })
                        .await
                }
                .await;
                if let Err(e) = result {
                    match e {
                        ServerError::Frame(tessera_protocol::FrameError::ConnectionClosed) => {}
                        e => debug!(error = %e, "verb stream ended with error"),
                    }
                }
            }
        })
        .await
}
