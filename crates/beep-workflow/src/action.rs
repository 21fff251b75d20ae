use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use beep_core::{CancellationToken, ProgressSink, ProgressUpdate};

use crate::events::{
    ActionDescriptor, ActionEvent, ActionEventKind, ActionId, ActionObserver, ActionProgress,
};
use crate::params::{ParameterValue, Parameters, ValidationError};

/// Terminal classification carried on the output channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionEventType {
    Success,
    Error,
    Cancelled,
    Stopped,
}

impl ActionEventType {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
            Self::Stopped => "Stopped",
        }
    }
}

/// What one `perform` produced.
#[derive(Clone, Debug)]
pub struct ActionResult {
    pub event_type: ActionEventType,
    pub message: String,
    /// The action's primary scalar output, when it has one.
    pub output: Option<ParameterValue>,
}

impl ActionResult {
    #[must_use]
    pub fn success(message: impl Into<String>, output: Option<ParameterValue>) -> Self {
        Self {
            event_type: ActionEventType::Success,
            message: message.into(),
            output,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: ActionEventType::Error,
            message: message.into(),
            output: None,
        }
    }

    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            event_type: ActionEventType::Cancelled,
            message: message.into(),
            output: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.event_type == ActionEventType::Success
    }
}

/// The work inside an action. Bodies must not block the caller with long
/// work of their own: anything long-running funnels through the execution
/// engine and reports progress through the provided sink.
pub trait ActionBody: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Ordered required input names; presence is validated before
    /// execution.
    fn required_inputs(&self) -> &'static [&'static str];

    /// Fail-fast validation beyond presence checks.
    fn validate(&self, inputs: &Parameters) -> Result<(), ValidationError> {
        let _ = inputs;
        Ok(())
    }

    fn execute(
        &self,
        inputs: &Parameters,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ActionResult>;
}

/// One step in a user pipeline: a body plus the uniform state machine
/// around it (typed parameters, lifecycle events, idempotent stop).
pub struct WorkflowAction {
    descriptor: ActionDescriptor,
    body: Box<dyn ActionBody>,
    in_parameters: Mutex<Parameters>,
    out_parameters: Mutex<Parameters>,
    running: AtomicBool,
    finished: AtomicBool,
    stop_flag: CancellationToken,
    observers: Mutex<Vec<ActionObserver>>,
}

impl WorkflowAction {
    #[must_use]
    pub fn new(name: impl Into<String>, body: Box<dyn ActionBody>) -> Arc<Self> {
        let descriptor = ActionDescriptor {
            id: ActionId::next(),
            type_name: body.type_name().to_string(),
            name: name.into(),
        };
        Arc::new(Self {
            descriptor,
            body,
            in_parameters: Mutex::new(Parameters::new()),
            out_parameters: Mutex::new(Parameters::new()),
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            stop_flag: CancellationToken::new(),
            observers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &ActionId {
        &self.descriptor.id
    }

    #[must_use]
    pub fn descriptor(&self) -> ActionDescriptor {
        self.descriptor.clone()
    }

    pub fn set_inputs(&self, parameters: Parameters) {
        *self.in_parameters.lock().expect("input lock") = parameters;
    }

    pub fn push_input(&self, name: impl Into<String>, value: ParameterValue) {
        self.in_parameters
            .lock()
            .expect("input lock")
            .push(name, value);
    }

    #[must_use]
    pub fn inputs(&self) -> Parameters {
        self.in_parameters.lock().expect("input lock").clone()
    }

    #[must_use]
    pub fn outputs(&self) -> Parameters {
        self.out_parameters.lock().expect("output lock").clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(AtomicOrdering::SeqCst)
    }

    pub fn subscribe(&self, observer: ActionObserver) {
        self.observers.lock().expect("observer lock").push(observer);
    }

    /// Validate, emit `Started`, run the body (forwarding its progress as
    /// `Running` events), then emit `Ended` and publish the output
    /// channel.
    pub fn perform(&self, progress: &ProgressSink, cancel: &CancellationToken) -> ActionResult {
        let inputs = self.inputs();
        if let Err(err) = self.validate_inputs(&inputs) {
            let result = ActionResult::error(err.to_string());
            self.publish_result(&result);
            self.emit(ActionEventKind::Ended, Some(100), result.message.clone());
            return result;
        }

        self.running.store(true, AtomicOrdering::SeqCst);
        self.finished.store(false, AtomicOrdering::SeqCst);
        self.emit(ActionEventKind::Started, Some(0), "started".to_string());

        let running_sink = self.running_sink(progress.clone());
        let merged = cancel.linked_with(&self.stop_flag);
        let mut result = match self.body.execute(&inputs, &running_sink, &merged) {
            Ok(result) => result,
            Err(err) => ActionResult::error(format!("{err:#}")),
        };
        // A stop that interrupted the body surfaces as Stopped, not
        // Cancelled, so callers can tell the two apart.
        if result.event_type == ActionEventType::Cancelled && self.stop_flag.is_cancelled() {
            result.event_type = ActionEventType::Stopped;
        }

        self.publish_result(&result);
        self.running.store(false, AtomicOrdering::SeqCst);
        self.finished.store(true, AtomicOrdering::SeqCst);
        self.emit(ActionEventKind::Ended, Some(100), result.message.clone());
        debug!(
            action = %self.descriptor.id,
            event_type = result.event_type.label(),
            "action finished"
        );
        result
    }

    /// `perform`, then hand the result to `after` before returning it.
    pub fn perform_with_hook(
        &self,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        after: impl FnOnce(&ActionResult),
    ) -> ActionResult {
        let result = self.perform(progress, cancel);
        after(&result);
        result
    }

    /// Asynchronous form: the body runs on a worker thread and the handle
    /// yields the result.
    pub fn perform_async(
        self: &Arc<Self>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> thread::JoinHandle<ActionResult> {
        let action = Arc::clone(self);
        thread::spawn(move || action.perform(&progress, &cancel))
    }

    /// Best-effort interrupt. Legal in any state, idempotent; queued work
    /// observes the flag at its next checkpoint.
    pub fn stop(&self) -> ActionResult {
        self.stop_flag.cancel();
        ActionResult {
            event_type: ActionEventType::Stopped,
            message: "stop requested".to_string(),
            output: None,
        }
    }

    fn validate_inputs(&self, inputs: &Parameters) -> Result<(), ValidationError> {
        for name in self.body.required_inputs() {
            if inputs.get(name).is_none() {
                return Err(ValidationError::MissingArg((*name).to_string()));
            }
        }
        self.body.validate(inputs)
    }

    fn publish_result(&self, result: &ActionResult) {
        let mut outputs = Parameters::new();
        outputs.push("message", ParameterValue::Str(result.message.clone()));
        outputs.push(
            "eventType",
            ParameterValue::Str(result.event_type.label().to_string()),
        );
        if let Some(output) = &result.output {
            outputs.push("output", output.clone());
        }
        *self.out_parameters.lock().expect("output lock") = outputs;
    }

    fn running_sink(&self, outer: ProgressSink) -> ProgressSink {
        let observers = self.observers.lock().expect("observer lock").clone();
        let descriptor = self.descriptor.clone();
        ProgressSink::new(move |update| {
            outer.emit(update.clone());
            let (percent, message) = describe_update(&update);
            let event = ActionEvent {
                kind: ActionEventKind::Running,
                action: descriptor.clone(),
                progress: ActionProgress { percent, message },
            };
            for observer in &observers {
                observer(&event);
            }
        })
    }

    fn emit(&self, kind: ActionEventKind, percent: Option<u8>, message: String) {
        let observers = self.observers.lock().expect("observer lock").clone();
        let event = ActionEvent {
            kind,
            action: self.descriptor.clone(),
            progress: ActionProgress { percent, message },
        };
        for observer in &observers {
            observer(&event);
        }
    }
}

fn describe_update(update: &ProgressUpdate) -> (Option<u8>, String) {
    match update {
        ProgressUpdate::Phase { label, percent } => (Some(*percent), label.clone()),
        ProgressUpdate::Bytes { done, total } => (
            None,
            match total {
                Some(total) => format!("{done}/{total} bytes"),
                None => format!("{done} bytes"),
            },
        ),
        ProgressUpdate::Package {
            current,
            total,
            name,
        } => (None, format!("[{current}/{total}] {name}")),
        ProgressUpdate::Message { text } => (None, text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct EchoBody {
        fail: bool,
    }

    impl ActionBody for EchoBody {
        fn type_name(&self) -> &'static str {
            "echo"
        }

        fn required_inputs(&self) -> &'static [&'static str] {
            &["text"]
        }

        fn execute(
            &self,
            inputs: &Parameters,
            progress: &ProgressSink,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ActionResult> {
            let text = inputs.require_str("text")?;
            progress.message(format!("echoing {text}"));
            if self.fail {
                anyhow::bail!("echo refused");
            }
            Ok(ActionResult::success(
                "echoed",
                Some(ParameterValue::Str(text.to_string())),
            ))
        }
    }

    fn collect_events(action: &Arc<WorkflowAction>) -> Arc<StdMutex<Vec<ActionEventKind>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        action.subscribe(Arc::new(move |event: &ActionEvent| {
            sink.lock().expect("events lock").push(event.kind);
        }));
        seen
    }

    #[test]
    fn perform_emits_started_running_ended_and_fills_outputs() {
        let action = WorkflowAction::new("echo-1", Box::new(EchoBody { fail: false }));
        action.push_input("text", ParameterValue::Str("hi".to_string()));
        let events = collect_events(&action);

        let result = action.perform(&ProgressSink::null(), &CancellationToken::new());
        assert!(result.is_success());
        assert!(action.is_finished());
        assert!(!action.is_running());

        let seen = events.lock().expect("events lock").clone();
        assert_eq!(
            seen,
            vec![
                ActionEventKind::Started,
                ActionEventKind::Running,
                ActionEventKind::Ended
            ]
        );

        let outputs = action.outputs();
        assert_eq!(
            outputs.get("eventType").and_then(ParameterValue::as_str),
            Some("Success")
        );
        assert_eq!(
            outputs.get("output").and_then(ParameterValue::as_str),
            Some("hi")
        );
        assert!(outputs.get("message").is_some());
    }

    #[test]
    fn missing_arguments_fail_fast_without_running_the_body() {
        let action = WorkflowAction::new("echo-2", Box::new(EchoBody { fail: false }));
        let events = collect_events(&action);

        let result = action.perform(&ProgressSink::null(), &CancellationToken::new());
        assert_eq!(result.event_type, ActionEventType::Error);
        assert!(result.message.contains("missing argument"));

        let seen = events.lock().expect("events lock").clone();
        assert_eq!(seen, vec![ActionEventKind::Ended]);
    }

    #[test]
    fn body_errors_become_error_results() {
        let action = WorkflowAction::new("echo-3", Box::new(EchoBody { fail: true }));
        action.push_input("text", ParameterValue::Str("hi".to_string()));
        let result = action.perform(&ProgressSink::null(), &CancellationToken::new());
        assert_eq!(result.event_type, ActionEventType::Error);
        assert!(result.message.contains("echo refused"));
        assert_eq!(
            action.outputs().get("eventType").and_then(ParameterValue::as_str),
            Some("Error")
        );
    }

    #[test]
    fn stop_is_idempotent_and_legal_before_any_run() {
        let action = WorkflowAction::new("echo-4", Box::new(EchoBody { fail: false }));
        let first = action.stop();
        let second = action.stop();
        assert_eq!(first.event_type, ActionEventType::Stopped);
        assert_eq!(second.event_type, ActionEventType::Stopped);
        assert!(!action.is_running());
    }

    #[test]
    fn perform_async_joins_with_the_result() {
        let action = WorkflowAction::new("echo-5", Box::new(EchoBody { fail: false }));
        action.push_input("text", ParameterValue::Str("bye".to_string()));
        let handle = action.perform_async(ProgressSink::null(), CancellationToken::new());
        let result = handle.join().expect("join");
        assert!(result.is_success());
    }

    #[test]
    fn hook_sees_the_result_before_return() {
        let action = WorkflowAction::new("echo-6", Box::new(EchoBody { fail: false }));
        action.push_input("text", ParameterValue::Str("hi".to_string()));
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        let result = action.perform_with_hook(
            &ProgressSink::null(),
            &CancellationToken::new(),
            move |result| {
                *sink.lock().expect("hook lock") = Some(result.event_type);
            },
        );
        assert!(result.is_success());
        assert_eq!(
            *seen.lock().expect("hook lock"),
            Some(ActionEventType::Success)
        );
    }
}
