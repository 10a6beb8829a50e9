//! In-memory collaborators for unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{CreateSession, SessionApi};
use crate::connection::{ConnectionMode, ConnectionState};
use crate::error::{ClientError, TransportError};
use crate::protocol::{
    Action, ClientCommand, Plan, SessionRecord, SessionState, SessionStatus, Step, StepStatus,
    UndoResponse,
};
use crate::transport::{Inbound, SessionTransport};

pub fn step(step_number: u32) -> Step {
    Step {
        step_number,
        url: Some(format!("https://app.test/{step_number}")),
        goal: Some(format!("goal {step_number}")),
        thinking: None,
        evaluation: None,
        screenshot: None,
        status: StepStatus::Completed,
        actions: vec![Action {
            name: "click".into(),
            params: serde_json::json!({ "index": step_number }),
            success: Some(true),
            error: None,
            enabled: true,
        }],
    }
}

pub fn steps(count: u32) -> Vec<Step> {
    (1..=count).map(step).collect()
}

/// Server-side state held by [`FakeApi`].
#[derive(Debug, Default)]
pub struct FakeServer {
    pub calls: Vec<String>,
    pub session_id: String,
    pub status: SessionStatus,
    pub steps: Vec<Step>,
    pub plan: Option<Plan>,
    /// Response to the next undo; `None` answers full success.
    pub undo: Option<UndoResponse>,
    /// Operation names that fail with HTTP 500.
    pub failing: HashSet<&'static str>,
}

/// Recording [`SessionApi`] that behaves like a small session server.
#[derive(Debug)]
pub struct FakeApi {
    server: Mutex<FakeServer>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            server: Mutex::new(FakeServer {
                session_id: "s1".into(),
                ..FakeServer::default()
            }),
        }
    }

    pub fn with(&self, f: impl FnOnce(&mut FakeServer)) {
        f(&mut self.server.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<String> {
        self.server.lock().unwrap().calls.clone()
    }

    fn record(&self, op: &'static str, detail: String) -> Result<(), ClientError> {
        let mut server = self.server.lock().unwrap();
        server.calls.push(if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op}:{detail}")
        });
        if server.failing.contains(op) {
            return Err(ClientError::Server {
                status: 500,
                message: format!("{op} failed"),
            });
        }
        Ok(())
    }

    fn record_for(&self, server: &FakeServer) -> SessionRecord {
        SessionRecord {
            id: server.session_id.clone(),
            status: server.status,
            headless: true,
            model: None,
            plan: server.plan.clone(),
        }
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn create_session(&self, request: &CreateSession) -> Result<SessionRecord, ClientError> {
        self.record("create_session", request.instruction.clone())?;
        let mut server = self.server.lock().unwrap();
        server.status = SessionStatus::GeneratingPlan;
        Ok(self.record_for(&server))
    }

    async fn get_session_state(&self, session_id: &str) -> Result<SessionState, ClientError> {
        self.record("get_session_state", session_id.to_string())?;
        let server = self.server.lock().unwrap();
        Ok(SessionState {
            session: self.record_for(&server),
            steps: server.steps.clone(),
        })
    }

    async fn list_steps(&self, session_id: &str) -> Result<Vec<Step>, ClientError> {
        self.record("list_steps", session_id.to_string())?;
        Ok(self.server.lock().unwrap().steps.clone())
    }

    async fn get_plan(&self, session_id: &str) -> Result<Option<Plan>, ClientError> {
        self.record("get_plan", session_id.to_string())?;
        Ok(self.server.lock().unwrap().plan.clone())
    }

    async fn approve_plan(&self, session_id: &str) -> Result<(), ClientError> {
        self.record("approve_plan", session_id.to_string())?;
        let mut server = self.server.lock().unwrap();
        server.status = SessionStatus::Approved;
        if let Some(plan) = server.plan.as_mut() {
            plan.approved = true;
        }
        Ok(())
    }

    async fn continue_session(
        &self,
        session_id: &str,
        instruction: &str,
    ) -> Result<SessionRecord, ClientError> {
        self.record("continue_session", format!("{session_id}:{instruction}"))?;
        let mut server = self.server.lock().unwrap();
        server.status = SessionStatus::GeneratingPlan;
        Ok(self.record_for(&server))
    }

    async fn reset_session(&self, session_id: &str) -> Result<SessionRecord, ClientError> {
        self.record("reset_session", session_id.to_string())?;
        let mut server = self.server.lock().unwrap();
        server.status = SessionStatus::PendingPlan;
        server.steps.clear();
        server.plan = None;
        Ok(self.record_for(&server))
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.record("stop_session", session_id.to_string())?;
        self.server.lock().unwrap().status = SessionStatus::Stopped;
        Ok(())
    }

    async fn undo_to_step(
        &self,
        session_id: &str,
        target_step_number: u32,
    ) -> Result<UndoResponse, ClientError> {
        self.record("undo_to_step", format!("{session_id}:{target_step_number}"))?;
        let mut server = self.server.lock().unwrap();
        let response = server.undo.take().unwrap_or(UndoResponse {
            success: true,
            ..UndoResponse::default()
        });
        let keep = if response.success {
            Some(target_step_number)
        } else {
            response.actual_step_number
        };
        if let Some(keep) = keep {
            server.steps.truncate(keep as usize);
        }
        Ok(response)
    }

    async fn delete_step(&self, session_id: &str, step_number: u32) -> Result<(), ClientError> {
        self.record("delete_step", format!("{session_id}:{step_number}"))?;
        let mut server = self.server.lock().unwrap();
        server.steps.retain(|s| s.step_number != step_number);
        for (i, s) in server.steps.iter_mut().enumerate() {
            s.step_number = i as u32 + 1;
        }
        Ok(())
    }

    async fn set_action_enabled(
        &self,
        session_id: &str,
        step_number: u32,
        action_index: usize,
        enabled: bool,
    ) -> Result<(), ClientError> {
        self.record(
            "set_action_enabled",
            format!("{session_id}:{step_number}:{action_index}:{enabled}"),
        )?;
        let mut server = self.server.lock().unwrap();
        if let Some(action) = server
            .steps
            .iter_mut()
            .find(|s| s.step_number == step_number)
            .and_then(|s| s.actions.get_mut(action_index))
        {
            action.enabled = enabled;
        }
        Ok(())
    }

    async fn post_command(
        &self,
        session_id: &str,
        command: &ClientCommand,
    ) -> Result<(), ClientError> {
        self.record("post_command", format!("{session_id}:{}", command.name()))
    }
}

/// [`SessionTransport`] that records commands and lets the test push inbound
/// traffic by hand through a [`TransportProbe`].
#[derive(Default)]
pub struct RecordingTransport {
    shared: Arc<Mutex<Recorded>>,
}

#[derive(Default)]
struct Recorded {
    sent: Vec<ClientCommand>,
    attached: Vec<String>,
    inbound: Option<mpsc::Sender<Inbound>>,
    mode: Option<ConnectionMode>,
    offline: bool,
}

/// Test-side handle to a [`RecordingTransport`] after it was boxed.
#[derive(Clone)]
pub struct TransportProbe {
    shared: Arc<Mutex<Recorded>>,
}

impl TransportProbe {
    pub fn sent(&self) -> Vec<ClientCommand> {
        self.shared.lock().unwrap().sent.clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(ClientCommand::name).collect()
    }

    pub fn attached(&self) -> Vec<String> {
        self.shared.lock().unwrap().attached.clone()
    }

    /// While offline every send fails as not viable.
    pub fn set_offline(&self, offline: bool) {
        self.shared.lock().unwrap().offline = offline;
    }

    pub fn clear(&self) {
        self.shared.lock().unwrap().sent.clear();
    }

    /// Queue inbound traffic for the controller.
    pub fn push(&self, item: Inbound) {
        if let Some(tx) = self.shared.lock().unwrap().inbound.as_ref() {
            tx.try_send(item).unwrap();
        }
    }
}

impl RecordingTransport {
    pub fn new() -> (Self, TransportProbe) {
        let transport = Self::default();
        let probe = TransportProbe {
            shared: Arc::clone(&transport.shared),
        };
        (transport, probe)
    }
}

#[async_trait]
impl SessionTransport for RecordingTransport {
    async fn attach(&mut self, session_id: &str) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        let mut shared = self.shared.lock().unwrap();
        shared.inbound = Some(tx);
        shared.attached.push(session_id.to_string());
        shared.mode = Some(ConnectionMode::Channel);
        Ok(rx)
    }

    async fn detach(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.inbound = None;
        shared.mode = None;
    }

    async fn send(&self, command: ClientCommand) -> Result<(), TransportError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.mode.is_none() || shared.offline {
            return Err(TransportError::NotViable {
                mode: ConnectionMode::Disconnected,
            });
        }
        shared.sent.push(command);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        let mut state = ConnectionState::new();
        if let Some(mode) = self.shared.lock().unwrap().mode {
            state.mode = mode;
        }
        state
    }
}
