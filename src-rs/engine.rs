use crate::client::{transport_failure_message, DiagnoseError};
use crate::model::{
    BatchCounters, DiagnoseResponse, QueueEntry, ResultRecord, NO_REPORT_PLACEHOLDER,
};
use crate::selection::ActiveSelection;
use chrono::Utc;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing queued, nothing outstanding.
    Idle,
    /// Queue has work and the in-flight slot is free.
    Dispatching,
    AwaitingSettle,
}

/// Identifies one outstanding diagnose call. A settle is only accepted when
/// its ticket equals the engine's current in-flight ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub generation: u64,
    pub seq: usize,
    pub file_name: String,
}

#[derive(Debug)]
pub struct Dispatch {
    pub ticket: Ticket,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Appended { index: usize },
    /// The ticket belongs to a superseded batch; nothing changed.
    Stale,
}

/// Queue, in-flight slot, result list and active selection for one session.
/// Strictly serial: `next_dispatch` hands out nothing while a ticket is
/// outstanding.
#[derive(Debug, Default)]
pub struct BatchEngine {
    generation: u64,
    submitted_at_ms: i64,
    next_seq: usize,
    queue: VecDeque<QueueEntry>,
    in_flight: Option<Ticket>,
    results: Vec<Arc<ResultRecord>>,
    selection: ActiveSelection,
    last_error: Option<String>,
}

impl BatchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces everything from the previous batch. An outstanding request of
    /// the old batch is not cancelled; its settle will come back stale.
    pub fn submit_batch(&mut self, files: Vec<QueueEntry>) -> u64 {
        if let Some(old) = self.in_flight.take() {
            info!(
                file = %old.file_name,
                generation = old.generation,
                "superseding batch with a request still outstanding"
            );
        }
        self.generation += 1;
        self.submitted_at_ms = Utc::now().timestamp_millis();
        self.next_seq = 0;
        self.queue = files.into();
        self.results.clear();
        self.selection.clear();
        self.last_error = None;
        info!(
            generation = self.generation,
            files = self.queue.len(),
            "batch submitted"
        );
        self.generation
    }

    /// One step of the dispatch loop: pops the queue head when the in-flight
    /// slot is free.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        let entry = self.queue.pop_front()?;
        let ticket = Ticket {
            generation: self.generation,
            seq: self.next_seq,
            file_name: entry.name,
        };
        self.next_seq += 1;
        self.in_flight = Some(ticket.clone());
        self.last_error = None;
        info!(
            file = %ticket.file_name,
            remaining = self.queue.len(),
            "dispatching"
        );
        Some(Dispatch {
            ticket,
            bytes: entry.bytes,
        })
    }

    /// Appends exactly one record for the settled ticket, whatever the
    /// outcome, and frees the in-flight slot.
    pub fn settle(
        &mut self,
        ticket: &Ticket,
        outcome: Result<DiagnoseResponse, DiagnoseError>,
    ) -> SettleOutcome {
        if self.in_flight.as_ref() != Some(ticket) {
            warn!(
                file = %ticket.file_name,
                generation = ticket.generation,
                current = self.generation,
                "discarding settle from a superseded batch"
            );
            return SettleOutcome::Stale;
        }

        let id = self.record_id(ticket);
        let (record, batch_error) = build_record(id, &ticket.file_name, outcome);
        if let Some(message) = batch_error {
            warn!(file = %ticket.file_name, error = %message, "item failed");
            self.last_error = Some(message);
        }

        self.results.push(Arc::new(record));
        self.selection.on_appended(self.results.len());
        self.in_flight = None;
        SettleOutcome::Appended {
            index: self.results.len() - 1,
        }
    }

    pub fn select_active(&mut self, index: usize) -> bool {
        self.selection.select(index, self.results.len())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        if self.in_flight.is_some() {
            Phase::AwaitingSettle
        } else if self.queue.is_empty() {
            Phase::Idle
        } else {
            Phase::Dispatching
        }
    }

    pub fn counters(&self) -> BatchCounters {
        BatchCounters::new(
            self.queue.len(),
            self.in_flight.is_some(),
            self.results.len(),
        )
    }

    pub fn in_flight(&self) -> Option<&Ticket> {
        self.in_flight.as_ref()
    }

    pub fn results(&self) -> &[Arc<ResultRecord>] {
        &self.results
    }

    pub fn active_index(&self) -> Option<usize> {
        self.selection.index()
    }

    pub fn active(&self) -> Option<&Arc<ResultRecord>> {
        self.selection.resolve(&self.results)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record_id(&self, ticket: &Ticket) -> String {
        let salt = rand::thread_rng().gen_range(1000..10000);
        format!(
            "{}-{}-{}-{salt}",
            ticket.file_name, self.submitted_at_ms, ticket.seq
        )
    }
}

/// Turns a settled call into its record, plus the batch-level error message
/// when the item counts as failed.
pub fn build_record(
    id: String,
    file_name: &str,
    outcome: Result<DiagnoseResponse, DiagnoseError>,
) -> (ResultRecord, Option<String>) {
    match outcome {
        Err(err) => {
            let message = transport_failure_message(file_name, &err);
            (
                ResultRecord::failed(id, file_name.to_string(), message.clone()),
                Some(message),
            )
        }
        Ok(response) if response.error.is_some() && !response.has_image() => {
            let error = response.error.unwrap_or_default();
            let batch_error = format!("Error (file: {file_name}): {error}");
            (
                ResultRecord::failed(id, file_name.to_string(), error),
                Some(batch_error),
            )
        }
        Ok(response) => {
            let image = response.converted_image.filter(|bytes| !bytes.is_empty());
            let record = ResultRecord {
                id,
                file_name: file_name.to_string(),
                image,
                annotations: Arc::new(response.annotations.unwrap_or_default()),
                report: Some(
                    response
                        .report
                        .unwrap_or_else(|| NO_REPORT_PLACEHOLDER.to_string()),
                ),
                error: response.error.map(|note| format!("Note: {note}")),
            };
            (record, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Annotation, RecordStatus};

    fn entry(name: &str) -> QueueEntry {
        QueueEntry::new(name, name.as_bytes().to_vec())
    }

    fn ok_response() -> DiagnoseResponse {
        DiagnoseResponse {
            converted_image: Some(vec![1, 2, 3]),
            annotations: Some(vec![Annotation {
                x: 10.0,
                y: 10.0,
                width: 4.0,
                height: 4.0,
                class_name: "caries".into(),
                confidence: 0.5,
            }]),
            report: Some("report".into()),
            error: None,
        }
    }

    fn assert_total_invariant(engine: &BatchEngine) {
        let c = engine.counters();
        assert_eq!(c.total, c.pending + c.in_flight + c.completed);
        assert!(c.in_flight <= 1);
    }

    #[test]
    fn processes_files_in_submission_order() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("a.dcm"), entry("b.dcm"), entry("c.dcm")]);
        assert_eq!(engine.phase(), Phase::Dispatching);

        let mut order = Vec::new();
        while let Some(dispatch) = engine.next_dispatch() {
            assert_total_invariant(&engine);
            assert_eq!(engine.counters().total, 3);
            order.push(dispatch.ticket.file_name.clone());
            engine.settle(&dispatch.ticket, Ok(ok_response()));
            assert_total_invariant(&engine);
        }

        assert_eq!(order, vec!["a.dcm", "b.dcm", "c.dcm"]);
        let names: Vec<_> = engine.results().iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, order);
        assert_eq!(engine.phase(), Phase::Idle);
        assert_eq!(engine.counters().completed, 3);
    }

    #[test]
    fn never_dispatches_twice_while_in_flight() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("a.dcm"), entry("b.dcm")]);
        let first = engine.next_dispatch().unwrap();
        assert_eq!(engine.phase(), Phase::AwaitingSettle);
        assert!(engine.next_dispatch().is_none());
        assert_eq!(engine.counters().pending, 1);

        engine.settle(&first.ticket, Ok(ok_response()));
        assert!(engine.next_dispatch().is_some());
    }

    #[test]
    fn failure_then_success_keeps_first_active() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("a.dcm"), entry("b.dcm")]);

        let a = engine.next_dispatch().unwrap();
        engine.settle(
            &a.ticket,
            Err(DiagnoseError::Transport("connection refused".into())),
        );
        assert_eq!(engine.active_index(), Some(0));
        assert_eq!(engine.last_error(), Some("a.dcm: connection refused"));

        let b = engine.next_dispatch().unwrap();
        assert!(engine.last_error().is_none());
        engine.settle(&b.ticket, Ok(ok_response()));

        let results = engine.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status(), RecordStatus::Error);
        assert_eq!(results[1].status(), RecordStatus::Processed);
        assert!(!results[1].annotations.is_empty());
        assert_eq!(engine.active_index(), Some(0));
    }

    #[test]
    fn new_batch_resets_everything() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("a.dcm"), entry("b.dcm")]);
        let a = engine.next_dispatch().unwrap();
        engine.settle(&a.ticket, Ok(ok_response()));
        assert_eq!(engine.active_index(), Some(0));

        let generation = engine.submit_batch(vec![entry("c.dcm"), entry("d.dcm"), entry("e.dcm")]);
        assert_eq!(generation, 2);
        let c = engine.counters();
        assert_eq!(c.completed, 0);
        assert_eq!(c.pending, 3);
        assert_eq!(c.in_flight, 0);
        assert_eq!(engine.active_index(), None);
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn stale_settle_is_discarded() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("old.dcm")]);
        let old = engine.next_dispatch().unwrap();

        engine.submit_batch(vec![entry("new.dcm")]);
        let new = engine.next_dispatch().unwrap();
        assert_eq!(new.ticket.generation, 2);

        assert_eq!(engine.settle(&old.ticket, Ok(ok_response())), SettleOutcome::Stale);
        assert!(engine.results().is_empty());
        assert_eq!(engine.phase(), Phase::AwaitingSettle);

        assert_eq!(
            engine.settle(&new.ticket, Ok(ok_response())),
            SettleOutcome::Appended { index: 0 }
        );
        assert_eq!(engine.results()[0].file_name, "new.dcm");
    }

    #[test]
    fn select_out_of_range_changes_nothing() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("a.dcm")]);
        let a = engine.next_dispatch().unwrap();
        engine.settle(&a.ticket, Ok(ok_response()));

        let before = engine.counters();
        assert!(!engine.select_active(3));
        assert_eq!(engine.active_index(), Some(0));
        assert_eq!(engine.counters(), before);
    }

    #[test]
    fn hard_server_failure_is_pure_error() {
        let response = DiagnoseResponse {
            converted_image: None,
            annotations: Some(Vec::new()),
            report: Some("Could not process DICOM file.".into()),
            error: Some("Failed to convert DICOM: bad".into()),
        };
        let (record, batch_error) = build_record("id".into(), "a.dcm", Ok(response));
        assert_eq!(record.status(), RecordStatus::Error);
        assert_eq!(record.error.as_deref(), Some("Failed to convert DICOM: bad"));
        assert!(record.report.is_none());
        assert_eq!(
            batch_error.as_deref(),
            Some("Error (file: a.dcm): Failed to convert DICOM: bad")
        );
    }

    #[test]
    fn soft_server_failure_keeps_data_as_note() {
        let mut response = ok_response();
        response.annotations = None;
        response.report = None;
        response.error = Some("detection failed".into());
        let (record, batch_error) = build_record("id".into(), "a.dcm", Ok(response));
        assert_eq!(record.status(), RecordStatus::Note);
        assert_eq!(record.error.as_deref(), Some("Note: detection failed"));
        assert_eq!(record.report.as_deref(), Some(NO_REPORT_PLACEHOLDER));
        assert!(record.annotations.is_empty());
        assert!(record.image.is_some());
        assert!(batch_error.is_none());
    }

    #[test]
    fn record_ids_are_distinct_for_same_name() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(vec![entry("a.dcm"), entry("a.dcm")]);
        for _ in 0..2 {
            let d = engine.next_dispatch().unwrap();
            engine.settle(&d.ticket, Ok(ok_response()));
        }
        let results = engine.results();
        assert_ne!(results[0].id, results[1].id);
        assert!(results[0].id.starts_with("a.dcm-"));
    }

    #[test]
    fn empty_batch_is_idle() {
        let mut engine = BatchEngine::new();
        engine.submit_batch(Vec::new());
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(engine.next_dispatch().is_none());
        assert_eq!(engine.counters().total, 0);
    }
}
