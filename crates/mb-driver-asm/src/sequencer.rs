//! Acquisition sequencer.
//!
//! A single worker task drains a FIFO of [`AcquisitionCommand`]s and drives
//! the start / scan field / finish protocol against the ASM. Producers never
//! block: they push commands and return. Results are delivered to the sink
//! carried by each `Next` command, in the order the fields were requested.
//!
//! ```text
//!            Start                 Stop
//!   Idle ─────────────▶ FieldScanning ──────▶ Idle
//!    │                      │
//!    └──── Terminate / worker failure ───▶ Terminated
//! ```
//!
//! Out-of-order commands (`Next` or `Stop` while idle, a second `Start`) are
//! logged and skipped. Any error inside the worker ends it: a best-effort
//! `finish_mega_field` is sent, the worker reports `Terminated` and only then
//! drops its pending commands, so a caller woken by the drop always finds the
//! worker gone. Every worker owns its queue. The next call to
//! [`AcquisitionSequencer::start`] spawns a fresh worker with an empty one.

use crate::client::AsmClient;
use crate::config::AcquisitionSettings;
use crate::descriptors::{DataContent, FieldMetadata, MegaFieldMetadata};
use crate::error::{AsmError, AsmResult};
use mb_core::data::{DataArray, Metadata, MD_FIELD_POSITION};
use mb_core::listeners::ListenerSet;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Observable state of the acquisition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Worker running (or not started yet), no mega-field open.
    Idle,
    /// A mega-field is open, fields can be scanned.
    FieldScanning,
    /// Worker has exited.
    Terminated,
}

/// Where the image of a scanned field goes.
pub enum FieldSink {
    /// Streaming acquisition: notify every subscriber.
    Subscribers(Arc<ListenerSet<DataArray>>),
    /// Single field acquisition: hand the image to the waiting caller.
    Reply(oneshot::Sender<DataArray>),
}

impl std::fmt::Debug for FieldSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldSink::Subscribers(listeners) => {
                write!(f, "Subscribers({})", listeners.len())
            }
            FieldSink::Reply(_) => write!(f, "Reply"),
        }
    }
}

impl FieldSink {
    fn deliver(self, image: DataArray) {
        match self {
            FieldSink::Subscribers(listeners) => listeners.notify(&image),
            FieldSink::Reply(sender) => {
                if sender.send(image).is_err() {
                    tracing::debug!("Single field image arrived after the caller stopped waiting");
                }
            }
        }
    }
}

/// Instruction for the acquisition worker.
#[derive(Debug)]
pub enum AcquisitionCommand {
    /// Open a mega-field. `metadata` is attached to every image of it.
    Start {
        /// Descriptor sent to the ASM.
        megafield: Box<MegaFieldMetadata>,
        /// Metadata of the images.
        metadata: Metadata,
    },
    /// Scan one field and deliver its image to `sink`.
    Next {
        /// Field to scan.
        field: FieldMetadata,
        /// Image to fetch.
        content: DataContent,
        /// Receiver of the image.
        sink: FieldSink,
    },
    /// Close the mega-field.
    Stop,
    /// End the worker.
    Terminate,
}

impl AcquisitionCommand {
    fn label(&self) -> &'static str {
        match self {
            AcquisitionCommand::Start { .. } => "start",
            AcquisitionCommand::Next { .. } => "next",
            AcquisitionCommand::Stop => "stop",
            AcquisitionCommand::Terminate => "terminate",
        }
    }
}

// =============================================================================
// Command queue
// =============================================================================

#[derive(Default)]
struct CommandQueue {
    commands: Mutex<VecDeque<AcquisitionCommand>>,
    available: Notify,
}

impl CommandQueue {
    fn push_all(&self, commands: impl IntoIterator<Item = AcquisitionCommand>) {
        self.commands.lock().extend(commands);
        self.available.notify_one();
    }

    fn push(&self, command: AcquisitionCommand) {
        self.push_all([command]);
    }

    async fn pop(&self) -> AcquisitionCommand {
        loop {
            let next = self.commands.lock().pop_front();
            if let Some(command) = next {
                return command;
            }
            self.available.notified().await;
        }
    }

    /// Drop every pending command, returning how many there were.
    fn clear(&self) -> usize {
        let mut commands = self.commands.lock();
        let count = commands.len();
        commands.clear();
        count
    }

    fn len(&self) -> usize {
        self.commands.lock().len()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    client: AsmClient,
    queue: Arc<CommandQueue>,
    state: Arc<watch::Sender<SequencerState>>,
    image_ready_delay: Duration,
    active: bool,
    metadata: Metadata,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let command = self.queue.pop().await;
            let label = command.label();
            tracing::debug!("Acquisition worker loaded command '{}'", label);

            match self.handle(command).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("Terminating acquisition");
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        "Last command was not executed, should have performed action '{}': {}. \
                         Reinitialize and restart the acquisition",
                        label,
                        e
                    );
                    break;
                }
            }
        }

        if let Err(e) = self.client.finish_mega_field().await {
            tracing::warn!("Closing the mega field after the acquisition worker ended failed: {}", e);
        }
        self.state.send_replace(SequencerState::Terminated);

        // Waiting single field callers see `WorkerStopped` from here on
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::warn!("Acquisition worker ended with {} pending commands dropped", dropped);
        }
        tracing::debug!("Acquisition worker ended");
    }

    /// Returns `Ok(false)` when the worker must stop.
    async fn handle(&mut self, command: AcquisitionCommand) -> AsmResult<bool> {
        match command {
            AcquisitionCommand::Start {
                megafield,
                metadata,
            } => {
                if self.active {
                    tracing::warn!("ASM acquisition already started, ignoring second 'start' command");
                    return Ok(true);
                }
                self.client.start_mega_field(&megafield).await?;
                self.active = true;
                self.metadata = metadata;
                self.state.send_replace(SequencerState::FieldScanning);
            }
            AcquisitionCommand::Next {
                field,
                content,
                sink,
            } => {
                if !self.active {
                    tracing::warn!("Start ASM acquisition before requesting field images");
                    return Ok(true);
                }
                self.client.scan_field(&field).await?;

                let image = match content.thumbnail_flag() {
                    None => DataArray::placeholder(),
                    Some(thumbnail) => {
                        // The ASM offers no way to wait until the image is stored.
                        tokio::time::sleep(self.image_ready_delay).await;
                        self.client.field_image(&field, thumbnail).await?
                    }
                };

                let mut metadata = self.metadata.clone();
                metadata.insert(
                    MD_FIELD_POSITION.to_string(),
                    json!([field.position_x, field.position_y]),
                );
                sink.deliver(image.with_metadata(metadata));
            }
            AcquisitionCommand::Stop => {
                if !self.active {
                    tracing::warn!("ASM acquisition was already stopped, ignoring 'stop' command");
                    return Ok(true);
                }
                self.active = false;
                self.client.finish_mega_field().await?;
                self.state.send_replace(SequencerState::Idle);
            }
            AcquisitionCommand::Terminate => return Ok(false),
        }
        Ok(true)
    }
}

// =============================================================================
// AcquisitionSequencer
// =============================================================================

/// Owner of the command queue and of the worker task.
pub struct AcquisitionSequencer {
    client: AsmClient,
    settings: AcquisitionSettings,
    runtime: Handle,
    /// Queue of the current worker.
    queue: Mutex<Arc<CommandQueue>>,
    state: Arc<watch::Sender<SequencerState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AcquisitionSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSequencer")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl AcquisitionSequencer {
    /// Create a sequencer whose worker runs on `runtime`.
    pub fn new(client: AsmClient, settings: AcquisitionSettings, runtime: Handle) -> Self {
        let (state, _) = watch::channel(SequencerState::Idle);
        Self {
            client,
            settings,
            runtime,
            queue: Mutex::new(Arc::new(CommandQueue::default())),
            state: Arc::new(state),
            worker: Mutex::new(None),
        }
    }

    /// Current worker state.
    pub fn state(&self) -> SequencerState {
        *self.state.borrow()
    }

    /// Follow the worker state.
    pub fn subscribe_state(&self) -> watch::Receiver<SequencerState> {
        self.state.subscribe()
    }

    /// Number of queued commands not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    fn queue(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.queue.lock())
    }

    /// Whether a worker is running and not terminating.
    pub fn is_worker_alive(&self) -> bool {
        self.worker_running(&self.worker.lock())
    }

    /// A worker that reported `Terminated` is treated as gone even if its
    /// task has not returned yet.
    fn worker_running(&self, worker: &Option<JoinHandle<()>>) -> bool {
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
            && self.state() != SequencerState::Terminated
    }

    /// Spawn a worker if none is running and return the queue feeding it.
    ///
    /// A new worker gets a new queue. Commands left in the old one are dropped
    /// and an exiting worker can never see commands meant for its successor.
    fn ensure_worker(&self) -> Arc<CommandQueue> {
        let mut worker = self.worker.lock();
        if self.worker_running(&worker) {
            return self.queue();
        }

        let queue = Arc::new(CommandQueue::default());
        let stale = std::mem::replace(&mut *self.queue.lock(), Arc::clone(&queue)).clear();
        tracing::info!(
            "Starting acquisition worker and clearing remainder of the old queue ({} commands)",
            stale
        );
        self.state.send_replace(SequencerState::Idle);
        let task = Worker {
            client: self.client.clone(),
            queue: Arc::clone(&queue),
            state: Arc::clone(&self.state),
            image_ready_delay: self.settings.image_ready_delay(),
            active: false,
            metadata: Metadata::new(),
        };
        *worker = Some(self.runtime.spawn(task.run()));
        queue
    }

    /// Queue the opening of a mega-field.
    pub fn start(&self, megafield: MegaFieldMetadata, metadata: Metadata) {
        self.ensure_worker().push(AcquisitionCommand::Start {
            megafield: Box::new(megafield),
            metadata,
        });
    }

    /// Queue the scan of one field.
    pub fn next(&self, field: FieldMetadata, content: DataContent, sink: FieldSink) {
        self.queue().push(AcquisitionCommand::Next {
            field,
            content,
            sink,
        });
    }

    /// Queue the closing of the mega-field.
    pub fn stop(&self) {
        self.queue().push(AcquisitionCommand::Stop);
    }

    /// Open a mega-field, scan one field, close it, and wait for the image.
    pub async fn single_field(
        &self,
        megafield: MegaFieldMetadata,
        metadata: Metadata,
        field: FieldMetadata,
        content: DataContent,
    ) -> AsmResult<DataArray> {
        let (sender, receiver) = oneshot::channel();
        self.ensure_worker().push_all([
            AcquisitionCommand::Start {
                megafield: Box::new(megafield),
                metadata,
            },
            AcquisitionCommand::Next {
                field,
                content,
                sink: FieldSink::Reply(sender),
            },
            AcquisitionCommand::Stop,
        ]);

        let limit = self.settings.single_field_timeout();
        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(_)) => Err(AsmError::WorkerStopped),
            Err(_) => Err(AsmError::Timeout(format!(
                "No field image received within {:?}",
                limit
            ))),
        }
    }

    /// Drop pending commands and close the mega-field.
    ///
    /// A field already sent to the ASM completes first. The wait for the
    /// worker doubles on every check; once it exceeds the configured budget
    /// the worker is terminated and a connectivity error returned.
    pub async fn cancel(&self) -> AsmResult<()> {
        let queue = self.queue();
        let dropped = queue.clear();
        if !self.is_worker_alive() {
            tracing::debug!("No acquisition worker running, dropped {} commands", dropped);
            return Ok(());
        }
        queue.push(AcquisitionCommand::Stop);

        let mut wait = self.settings.cancel_initial_wait();
        loop {
            tokio::time::sleep(wait).await;
            let drained = self.pending() == 0 && self.state() != SequencerState::FieldScanning;
            if drained || !self.is_worker_alive() {
                tracing::info!("Acquisition cancelled ({} pending commands dropped)", dropped);
                return Ok(());
            }

            wait *= 2;
            if wait > self.settings.cancel_max_wait() {
                tracing::error!("Failed to cancel the acquisition, terminating the acquisition worker");
                self.terminate().await;
                return Err(AsmError::Connectivity(
                    "Connection quality was too low to cancel the acquisition. The acquisition \
                     worker is terminated."
                        .to_string(),
                ));
            }
        }
    }

    /// Stop the worker.
    ///
    /// Waits for the worker to pick up the terminate command. If it does not
    /// within the configured time (e.g. stuck in a call), it is aborted and
    /// the mega-field closed from here.
    pub async fn terminate(&self) {
        let queue = self.queue();
        queue.clear();
        let handle = self.worker.lock().take();
        let Some(mut handle) = handle else {
            return;
        };
        if handle.is_finished() {
            return;
        }

        queue.push(AcquisitionCommand::Terminate);
        let limit = self.settings.terminate_timeout();
        if tokio::time::timeout(limit, &mut handle).await.is_err() {
            tracing::warn!(
                "Acquisition worker did not stop within {:?}, aborting it",
                limit
            );
            handle.abort();
            queue.clear();
            if let Err(e) = self.client.finish_mega_field().await {
                tracing::warn!("Closing the mega field after aborting the worker failed: {}", e);
            }
            self.state.send_replace(SequencerState::Terminated);
        }
    }
}

impl Drop for AcquisitionSequencer {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AsmSettings;
    use crate::descriptors::CellParameters;
    use crate::simulator::{SimulatedAsm, SIMULATED_HOST};

    fn megafield() -> MegaFieldMetadata {
        MegaFieldMetadata {
            mega_field_id: "test".into(),
            storage_directory: "/images".into(),
            custom_data: "No_custom_data".into(),
            stage_position_x: 0.0,
            stage_position_y: 0.0,
            pixel_size: 4,
            dwell_time: 2,
            x_scan_to_acq_delay: 0,
            x_scan_delay: 0,
            x_cell_size: 20,
            y_cell_size: 20,
            x_eff_cell_size: 10,
            y_eff_cell_size: 10,
            y_prescan_lines: 0,
            x_scan_gain: 0.0,
            y_scan_gain: 0.0,
            x_scan_offset: 0.0,
            y_scan_offset: 0.0,
            x_descan_setpoints: vec![0; 4],
            y_descan_setpoints: vec![0; 4],
            x_descan_offset: 0,
            y_descan_offset: 0,
            scan_rotation: 0.0,
            descan_rotation: 0.0,
            cell_parameters: vec![
                CellParameters {
                    x_eff_orig: 0,
                    y_eff_orig: 0,
                    digital_gain: 1.0,
                    dark_offset: 0,
                };
                4
            ],
        }
    }

    fn sequencer(asm: Arc<SimulatedAsm>) -> AcquisitionSequencer {
        let client = AsmClient::new(asm, &AsmSettings::new(SIMULATED_HOST));
        let settings = AcquisitionSettings {
            image_ready_delay_ms: 0,
            cancel_initial_wait_ms: 10,
            terminate_timeout_secs: 1,
            ..AcquisitionSettings::default()
        };
        AcquisitionSequencer::new(client, settings, Handle::current())
    }

    #[tokio::test]
    async fn single_field_runs_start_next_stop() {
        let asm = Arc::new(SimulatedAsm::new());
        let sequencer = sequencer(asm.clone());

        let image = sequencer
            .single_field(
                megafield(),
                Metadata::new(),
                FieldMetadata {
                    position_x: 10,
                    position_y: 20,
                },
                DataContent::Thumbnail,
            )
            .await
            .unwrap();
        assert_eq!(image.shape(), (100, 100));
        assert_eq!(image.metadata[MD_FIELD_POSITION], json!([10, 20]));
        assert_eq!(asm.request_count("/scan/start_mega_field"), 1);
        assert_eq!(asm.request_count("/scan/scan_field"), 1);
    }

    #[tokio::test]
    async fn worker_failure_reports_worker_stopped_and_restarts() {
        let asm = Arc::new(SimulatedAsm::new());
        let sequencer = sequencer(asm.clone());
        asm.fail_endpoint("/scan/start_mega_field", 500);

        let field = FieldMetadata {
            position_x: 0,
            position_y: 0,
        };
        let err = sequencer
            .single_field(megafield(), Metadata::new(), field, DataContent::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, AsmError::WorkerStopped));

        let mut state = sequencer.subscribe_state();
        state
            .wait_for(|s| *s == SequencerState::Terminated)
            .await
            .unwrap();
        assert_eq!(sequencer.pending(), 0);

        asm.clear_failures();
        let image = sequencer
            .single_field(megafield(), Metadata::new(), field, DataContent::Empty)
            .await
            .unwrap();
        assert_eq!(image.shape(), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_right_after_failure_gets_a_fresh_worker() {
        let asm = Arc::new(SimulatedAsm::new().with_finish_delay(Duration::from_millis(300)));
        let sequencer = sequencer(asm.clone());
        asm.fail_endpoint("/scan/scan_field", 500);

        let field = FieldMetadata {
            position_x: 0,
            position_y: 0,
        };
        let err = sequencer
            .single_field(megafield(), Metadata::new(), field, DataContent::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, AsmError::WorkerStopped));
        assert_eq!(sequencer.state(), SequencerState::Terminated);

        asm.clear_failures();
        let image = tokio::time::timeout(
            Duration::from_secs(3),
            sequencer.single_field(megafield(), Metadata::new(), field, DataContent::Empty),
        )
        .await
        .expect("retry should not wait for the single field timeout")
        .unwrap();
        assert_eq!(image.shape(), (1, 1));
        assert_eq!(asm.request_count("/scan/start_mega_field"), 2);
    }

    #[tokio::test]
    async fn out_of_order_commands_are_skipped() {
        let asm = Arc::new(SimulatedAsm::new());
        let sequencer = sequencer(asm.clone());
        let listeners = Arc::new(ListenerSet::new());

        sequencer.start(megafield(), Metadata::new());
        sequencer.stop();
        sequencer.stop();
        sequencer.next(
            FieldMetadata {
                position_x: 0,
                position_y: 0,
            },
            DataContent::Empty,
            FieldSink::Subscribers(listeners),
        );
        while sequencer.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(sequencer.is_worker_alive());
        assert_eq!(sequencer.state(), SequencerState::Idle);
        assert_eq!(asm.request_count("/scan/start_mega_field"), 1);
        assert_eq!(asm.request_count("/scan/scan_field"), 0);
        assert!(asm.open_megafield().is_none());

        sequencer.cancel().await.unwrap();
        assert!(sequencer.is_worker_alive());

        sequencer.terminate().await;
        assert!(!sequencer.is_worker_alive());
    }
}
