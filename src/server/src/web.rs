use crate::{queue::Task, reporter::ReportSink};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;
use wire::CaseResult;

/// Task source failure. Never tears down a worker connection by itself; the
/// task-fetch loop escalates repeated failures to a process shutdown because
/// no new work can be sourced.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("task source request failed")]
    Http(#[from] reqwest::Error),
    #[error("task source sent malformed json")]
    Malformed(#[from] serde_json::Error),
    #[error("task source response failed the checksum")]
    Checksum,
    #[error("task source rejected the request: {0}")]
    Rejected(String),
}

fn sha1_hex(data: &str) -> String {
    hex::encode(openssl::sha::sha1(data.as_bytes()))
}

/// One thread's view of the task source. The production implementation is
/// `WebClient`; tests substitute their own. The reporter's sink methods are
/// part of the same seam.
pub trait TaskSource: ReportSink {
    fn fetch_task(&mut self) -> Result<Option<Task>, UpstreamError>;
    fn query_list(&mut self) -> Result<Vec<String>, UpstreamError>;
    fn register_judge(
        &mut self,
        id: &str,
        langs: &[String],
        answers: &HashMap<String, String>,
    ) -> Result<u64, UpstreamError>;
    fn remove_judge(&mut self, judge_key: u64) -> Result<(), UpstreamError>;
}

impl ReportSink for Box<dyn TaskSource> {
    fn deliver(&mut self, report: &crate::reporter::Report) -> Result<(), UpstreamError> {
        (**self).deliver(report)
    }

    fn deliver_progress(&mut self, task: u64, case: u32) -> Result<(), UpstreamError> {
        (**self).deliver_progress(task, case)
    }
}

/// Hands out one `TaskSource` handle per thread that needs to talk upstream.
pub trait TaskSourceProvider: Send + Sync {
    fn connect(&self) -> Box<dyn TaskSource>;
}

/// Connection-independent description of the production task source.
pub struct WebEndpoint {
    url: String,
    secret: String,
    timeout: Duration,
    next_client: AtomicU64,
}

impl WebEndpoint {
    pub fn new(url: String, secret: String, timeout: Duration) -> WebEndpoint {
        WebEndpoint {
            url,
            // the shared secret never travels; only its digest enters the
            // checksum preimage
            secret: sha1_hex(&secret),
            timeout,
            next_client: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> WebClient {
        WebClient {
            url: self.url.clone(),
            secret: self.secret.clone(),
            http: reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .expect("failed to initialize http client"),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed),
            req_id: 0,
        }
    }
}

impl TaskSourceProvider for WebEndpoint {
    fn connect(&self) -> Box<dyn TaskSource> {
        Box::new(self.client())
    }
}

/// One thread's handle to the task source. Requests carry a strictly
/// increasing `req` counter and a rolling SHA-1 checksum derived from the
/// shared secret; responses are verified the same way.
pub struct WebClient {
    url: String,
    secret: String,
    http: reqwest::blocking::Client,
    client_id: u64,
    req_id: u64,
}

impl WebClient {
    fn call(&mut self, action: &str, payload: Value) -> Result<Value, UpstreamError> {
        self.req_id += 1;
        let data = json!({ "action": action, "payload": payload }).to_string();
        let checksum = sha1_hex(&format!(
            "{}{}{}{}",
            self.client_id, self.req_id, self.secret, data
        ));
        let body = json!({
            "client": self.client_id,
            "req": self.req_id,
            "data": data,
            "checksum": checksum,
        });
        debug!(action, client = self.client_id, req = self.req_id, "task source call");
        let text = self
            .http
            .post(&self.url)
            .form(&[("data", body.to_string())])
            .send()?
            .error_for_status()?
            .text()?;
        let reply: Value = serde_json::from_str(&text)?;
        let status = reply["status"].as_u64().unwrap_or(1);
        let reply_data = reply["data"].to_string();
        let expected = sha1_hex(&format!(
            "{}{}{}{}{}",
            self.client_id, self.req_id, self.secret, status, reply_data
        ));
        if reply["checksum"].as_str() != Some(expected.as_str()) {
            return Err(UpstreamError::Checksum);
        }
        if status != 0 {
            let reason = reply["data"]
                .as_str()
                .unwrap_or("unspecified reason")
                .to_string();
            return Err(UpstreamError::Rejected(reason));
        }
        Ok(reply["data"].clone())
    }

    pub fn report_syncing_data(&mut self, task: u64, judge_key: u64) -> Result<(), UpstreamError> {
        self.call("report-syncing-data", json!({ "task": task, "judge": judge_key }))?;
        Ok(())
    }

    /// Terminal: the server has no data directory for the task's problem.
    pub fn report_no_data(&mut self, task: u64) -> Result<(), UpstreamError> {
        self.call("report-no-data", json!({ "task": task }))?;
        Ok(())
    }

    pub fn report_compiling(&mut self, task: u64) -> Result<(), UpstreamError> {
        self.call("report-compiling", json!({ "task": task }))?;
        Ok(())
    }

    pub fn report_compile_result(
        &mut self,
        task: u64,
        ok: bool,
        log: &str,
    ) -> Result<(), UpstreamError> {
        self.call(
            "report-compile-result",
            json!({ "task": task, "ok": ok, "log": log }),
        )?;
        Ok(())
    }

    /// Progress is coalesced by the reporter: only the newest case number
    /// needs to arrive.
    pub fn report_progress(&mut self, task: u64, current_case: u32) -> Result<(), UpstreamError> {
        self.call(
            "report-progress",
            json!({ "task": task, "case": current_case }),
        )?;
        Ok(())
    }

    pub fn report_case_result(
        &mut self,
        task: u64,
        case: u32,
        result: &CaseResult,
    ) -> Result<(), UpstreamError> {
        self.call(
            "report-case-result",
            json!({ "task": task, "case": case, "result": result }),
        )?;
        Ok(())
    }

    pub fn report_judge_finished(&mut self, task: u64) -> Result<(), UpstreamError> {
        self.call("report-judge-finished", json!({ "task": task }))?;
        Ok(())
    }

    /// Human-readable failure note for a task that could not be judged.
    pub fn report_task_error(&mut self, task: u64, reason: &str) -> Result<(), UpstreamError> {
        self.call(
            "report-task-error",
            json!({ "task": task, "reason": reason }),
        )?;
        Ok(())
    }
}

impl TaskSource for WebClient {
    /// Asks for one new task; `None` when the source has nothing pending.
    fn fetch_task(&mut self) -> Result<Option<Task>, UpstreamError> {
        let data = self.call("fetch-task", Value::Null)?;
        if data.is_null() {
            return Ok(None);
        }
        let task: Task = serde_json::from_value(data)?;
        Ok(Some(task))
    }

    /// The info keys the task source wants answered by each new judge.
    fn query_list(&mut self) -> Result<Vec<String>, UpstreamError> {
        let data = self.call("query-list", Value::Null)?;
        Ok(serde_json::from_value(data)?)
    }

    /// Registers a judge; the returned numeric key identifies it upstream.
    fn register_judge(
        &mut self,
        id: &str,
        langs: &[String],
        answers: &HashMap<String, String>,
    ) -> Result<u64, UpstreamError> {
        let data = self.call(
            "register-judge",
            json!({ "id": id, "langs": langs, "answers": answers }),
        )?;
        serde_json::from_value(data).map_err(UpstreamError::from)
    }

    fn remove_judge(&mut self, judge_key: u64) -> Result<(), UpstreamError> {
        self.call("remove-judge", json!({ "judge": judge_key }))?;
        Ok(())
    }
}
