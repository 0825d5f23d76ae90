use super::events::{Command, EventBus, KernelEvent};
use super::graph::{GraphOutput, StageGraph};
use super::state::KernelState;
use crate::core::{Epoch, SampleBlock};
use crate::extract::{EpochCounts, EpochExtractor, ExtractorConfig};
use crate::hal::{AiPacket, AoRequest, Channel, Direction, Engine, EngineChannels, EngineConfig};
use crate::observability::MetricsCollector;
use crate::queue::{QueueAppender, QueueEvent, QueuePolicy, SignalQueue};
use crate::store::ContinuousWriter;
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// How long the loop waits for engine traffic before polling extractors
const IDLE_POLL: Duration = Duration::from_millis(10);

/// How long an essential event may wait for room in a full event channel
const EMIT_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Ties an epoch extractor to an input (or one of its stages) and the output
/// whose queue announces the trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorBinding {
    pub name: String,
    pub input: String,
    pub output: String,

    /// Graph stage feeding the extractor; the raw input when unset
    #[serde(default)]
    pub source: Option<String>,

    /// Sample rate at `source`; the input's rate when unset
    #[serde(default)]
    pub fs: Option<f64>,

    #[serde(default)]
    pub config: ExtractorConfig,
}

impl ExtractorBinding {
    pub fn new(name: impl Into<String>, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            source: None,
            fs: None,
            config: ExtractorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExtractorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_source(mut self, stage: impl Into<String>, fs: f64) -> Self {
        self.source = Some(stage.into());
        self.fs = Some(fs);
        self
    }
}

enum LoopCommand {
    Start(String),
    Pause(String),
    Hold(bool),
    Stop,
}

type QueuePreparer = Box<dyn FnMut(&QueueAppender, &Channel) -> Result<()> + Send>;

struct InputLine {
    name: String,
    channel: Channel,
    graph: StageGraph,
    writer: Option<ContinuousWriter>,
    publish: bool,
    out_of_range: bool,
}

struct OutputLine {
    name: String,
    channel: Channel,
    queue: SignalQueue,
    /// Silent samples before the first onset, so every pre-stimulus window
    /// lies inside the acquired stream
    lead: u64,
    active: bool,
    queue_ended: bool,
    complete: bool,
}

struct ExtractorLine {
    name: String,
    input: String,
    output: String,
    source: Option<String>,
    extractor: EpochExtractor,
    /// Decrements the output queue for every accepted epoch
    counts_trials: bool,
}

/// Everything the acquisition loop owns while it runs
struct Acquisition {
    inputs: Vec<InputLine>,
    outputs: Vec<OutputLine>,
    extractors: Vec<ExtractorLine>,
    queue_end_tx: Sender<String>,
    queue_end_rx: Receiver<String>,
    samples_acquired: u64,
}

fn emit(events: &Sender<KernelEvent>, event: KernelEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(KernelEvent::Acquired { input, .. })) => {
            tracing::debug!(%input, "event channel full, dropping acquired block");
        }
        Err(TrySendError::Full(event)) => {
            let name = event.name();
            if events.send_timeout(event, EMIT_TIMEOUT).is_err() {
                tracing::warn!(event = %name, "control side not draining events, dropped");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

impl Acquisition {
    fn new() -> Self {
        let (queue_end_tx, queue_end_rx) = unbounded();
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            extractors: Vec::new(),
            queue_end_tx,
            queue_end_rx,
            samples_acquired: 0,
        }
    }

    fn run(
        mut self,
        channels: EngineChannels,
        events: Sender<KernelEvent>,
        commands: Receiver<LoopCommand>,
    ) -> Self {
        let mut held = false;
        loop {
            crossbeam_channel::select! {
                recv(commands) -> command => match command {
                    Ok(LoopCommand::Start(output)) => self.set_active(&output, true),
                    Ok(LoopCommand::Pause(output)) => self.set_active(&output, false),
                    Ok(LoopCommand::Hold(hold)) => held = hold,
                    Ok(LoopCommand::Stop) | Err(_) => break,
                },
                recv(channels.ao_request_rx) -> request => match request {
                    Ok(request) => self.answer(&channels, request, held),
                    Err(_) => {
                        self.engine_lost(&events);
                        break;
                    }
                },
                recv(channels.ai_rx) -> packet => match packet {
                    Ok(packet) => self.acquire(packet, &events),
                    Err(_) => {
                        self.engine_lost(&events);
                        break;
                    }
                },
                default(IDLE_POLL) => {}
            }
            self.poll(&events);
        }
        self.teardown(&events);
        self
    }

    fn engine_lost(&self, events: &Sender<KernelEvent>) {
        tracing::error!("engine channels closed during acquisition");
        emit(
            events,
            KernelEvent::Error {
                message: "engine channels closed during acquisition".to_string(),
            },
        );
    }

    fn set_active(&mut self, output: &str, active: bool) {
        if let Some(line) = self.outputs.iter_mut().find(|o| o.name == output) {
            tracing::info!(%output, active, "output state changed");
            line.active = active;
        }
    }

    fn answer(&mut self, channels: &EngineChannels, request: AoRequest, held: bool) {
        let mut samples = match self.outputs.iter_mut().find(|o| o.name == request.channel) {
            Some(line) if line.active && !held => {
                let silent = line.lead.saturating_sub(request.s0).min(request.n as u64);
                line.queue.align(request.s0 + silent);
                let mut samples = vec![0.0; silent as usize];
                samples.extend(line.queue.pop_buffer(request.n - silent as usize));
                let (lower, upper) = line.channel.expected_range;
                let clipped = samples.iter().filter(|v| !line.channel.in_range(**v)).count();
                if clipped > 0 {
                    tracing::warn!(output = %line.name, clipped, "output exceeds expected range, clipping");
                    for v in samples.iter_mut() {
                        *v = if v.is_nan() { 0.0 } else { (*v).clamp(lower, upper) };
                    }
                }
                samples
            }
            _ => Vec::new(),
        };
        samples.resize(request.n, 0.0);
        if let Err(e) = channels.write_ao(&request.channel, request.s0, samples) {
            tracing::warn!(error = %e, "failed to hand output to engine");
        }
    }

    fn acquire(&mut self, packet: AiPacket, events: &Sender<KernelEvent>) {
        let Some(input) = self.inputs.iter_mut().find(|i| i.name == packet.channel) else {
            tracing::trace!(channel = %packet.channel, "packet for an input without consumers");
            return;
        };

        if !input.out_of_range && packet.samples.iter().any(|v| !input.channel.in_range(*v)) {
            input.out_of_range = true;
            tracing::warn!(input = %input.name, "input left its expected range");
        }

        let block = SampleBlock::mono(packet.s0, packet.fs, packet.samples);
        self.samples_acquired = self.samples_acquired.max(block.end());

        if let Some(writer) = input.writer.as_mut() {
            if let Err(e) = writer.append(&block) {
                tracing::error!(input = %input.name, error = %e, "continuous store append failed, recording stopped");
                input.writer = None;
            }
        }
        if input.publish {
            emit(
                events,
                KernelEvent::Acquired {
                    input: input.name.clone(),
                    block: block.clone(),
                },
            );
        }

        let staged = if input.graph.is_empty() {
            GraphOutput::new()
        } else {
            match input.graph.push(block.clone()) {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(input = %input.name, error = %e, "stage graph failed");
                    emit(events, KernelEvent::Error { message: e.to_string() });
                    GraphOutput::new()
                }
            }
        };

        for line in self.extractors.iter_mut().filter(|e| e.input == input.name) {
            let blocks = match &line.source {
                None => vec![block.clone()],
                Some(stage) => staged.get(stage).cloned().unwrap_or_default(),
            };
            let mut epochs = Vec::new();
            for b in &blocks {
                epochs.extend(line.extractor.process(b));
            }
            if epochs.is_empty() {
                continue;
            }

            if line.counts_trials {
                if let Some(output) = self.outputs.iter_mut().find(|o| o.name == line.output) {
                    epochs = count_trials(&mut output.queue, epochs);
                }
            }
            if !epochs.is_empty() {
                emit(
                    events,
                    KernelEvent::Epochs {
                        extractor: line.name.clone(),
                        output: line.output.clone(),
                        epochs,
                    },
                );
            }
        }
        self.update_completion(events);
    }

    fn poll(&mut self, events: &Sender<KernelEvent>) {
        while let Ok(output) = self.queue_end_rx.try_recv() {
            if let Some(line) = self.outputs.iter_mut().find(|o| o.name == output) {
                line.queue_ended = true;
            }
            emit(events, KernelEvent::QueueEnd { output });
        }
        for line in self.extractors.iter_mut() {
            line.extractor.poll();
        }
        self.update_completion(events);
    }

    fn update_completion(&mut self, events: &Sender<KernelEvent>) {
        for output in self.outputs.iter_mut().filter(|o| !o.complete) {
            let mut bound = self.extractors.iter().filter(|e| e.output == output.name).peekable();
            let done = if bound.peek().is_none() {
                output.queue_ended
            } else {
                bound.all(|e| e.extractor.is_complete())
            };
            if done {
                output.complete = true;
                tracing::info!(output = %output.name, "output complete");
                emit(
                    events,
                    KernelEvent::Complete {
                        output: output.name.clone(),
                    },
                );
            }
        }
    }

    fn teardown(&mut self, events: &Sender<KernelEvent>) {
        for line in self.extractors.iter_mut() {
            let discarded = line.extractor.finish();
            if !discarded.is_empty() {
                tracing::info!(extractor = %line.name, count = discarded.len(), "acquisition stopped with epochs outstanding");
            }
        }
        for input in self.inputs.iter_mut() {
            if let Some(writer) = input.writer.as_mut() {
                if let Err(e) = writer.flush() {
                    tracing::error!(input = %input.name, error = %e, "continuous store flush failed");
                }
            }
        }
        emit(
            events,
            KernelEvent::Stopped {
                samples_acquired: self.samples_acquired,
            },
        );
    }
}

/// Keep epochs whose queue entry still needs trials, spending one trial each
fn count_trials(queue: &mut SignalQueue, epochs: Vec<Epoch>) -> Vec<Epoch> {
    epochs
        .into_iter()
        .filter(|epoch| match epoch.key {
            Some(key) if queue.remaining_trials(key).is_some() => {
                queue.decrement_key(key);
                true
            }
            Some(key) => {
                tracing::debug!(key, "epoch beyond the requested count, dropped");
                false
            }
            None => true,
        })
        .collect()
}

/// Orchestrates one acquisition: engine, stage graphs, signal queues and
/// epoch extractors.
///
/// Setup happens on the control side while the kernel is idle. `start` moves
/// graphs, queues and extractors into a blocking acquisition loop fed by the
/// engine; results come back as [`KernelEvent`]s through a bounded channel
/// and are delivered to bus subscribers by [`AcquisitionKernel::dispatch`].
pub struct AcquisitionKernel {
    engine: Box<dyn Engine>,
    engine_config: EngineConfig,
    channels: BTreeMap<String, Channel>,

    /// Present while idle and after the loop hands it back
    acquisition: Option<Acquisition>,
    appenders: BTreeMap<String, QueueAppender>,
    preparers: BTreeMap<String, QueuePreparer>,
    collectors: BTreeMap<String, MetricsCollector>,

    bus: EventBus,
    state: KernelState,
    event_capacity: usize,
    events_rx: Option<Receiver<KernelEvent>>,
    command_tx: Option<Sender<LoopCommand>>,
    worker: Option<JoinHandle<Acquisition>>,

    started_at: Option<Instant>,
    completed: BTreeSet<String>,
    last_error: Option<String>,
    samples_acquired: u64,
}

impl AcquisitionKernel {
    pub fn new(engine: Box<dyn Engine>, engine_config: EngineConfig) -> Result<Self> {
        engine_config.validate()?;
        let channels = engine_config
            .channels
            .iter()
            .map(|c| (c.name.clone(), Channel::from(c)))
            .collect();
        Ok(Self {
            engine,
            engine_config,
            channels,
            acquisition: Some(Acquisition::new()),
            appenders: BTreeMap::new(),
            preparers: BTreeMap::new(),
            collectors: BTreeMap::new(),
            bus: EventBus::new(),
            state: KernelState::Idle,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            events_rx: None,
            command_tx: None,
            worker: None,
            started_at: None,
            completed: BTreeSet::new(),
            last_error: None,
            samples_acquired: 0,
        })
    }

    /// Bound on events waiting for the control side
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn channel(&self, name: &str) -> Result<&Channel> {
        self.channels
            .get(name)
            .ok_or_else(|| anyhow!("Unknown channel: {}", name))
    }

    fn channel_as(&self, name: &str, direction: Direction) -> Result<Channel> {
        let channel = self.channel(name)?;
        if channel.direction != direction {
            bail!("Channel {} is not an {:?} channel", name, direction);
        }
        Ok(channel.clone())
    }

    fn setup(&mut self) -> Result<&mut Acquisition> {
        if self.state != KernelState::Idle {
            bail!("Kernel can only be set up while idle (currently {})", self.state.name());
        }
        self.acquisition
            .as_mut()
            .ok_or_else(|| anyhow!("Acquisition is not available"))
    }

    /// Attach a signal queue to an output channel
    pub fn add_output(
        &mut self,
        name: &str,
        policy: QueuePolicy,
        auto_decrement: bool,
    ) -> Result<QueueAppender> {
        policy.validate()?;
        let channel = self.channel_as(name, Direction::Output)?;
        let acquisition = self.setup()?;
        if acquisition.outputs.iter().any(|o| o.name == name) {
            bail!("Output {} already has a queue", name);
        }

        let mut queue = SignalQueue::new(channel.fs, policy).with_auto_decrement(auto_decrement);
        let tx = acquisition.queue_end_tx.clone();
        let output = name.to_string();
        queue.subscribe(move |event| {
            if *event == QueueEvent::End {
                let _ = tx.send(output.clone());
            }
        });
        let appender = queue.appender();

        acquisition.outputs.push(OutputLine {
            name: name.to_string(),
            channel,
            queue,
            lead: 0,
            active: false,
            queue_ended: false,
            complete: false,
        });
        self.appenders.insert(name.to_string(), appender.clone());
        Ok(appender)
    }

    /// Route an input channel through a stage graph (empty for raw access)
    pub fn add_input(&mut self, name: &str, mut graph: StageGraph) -> Result<()> {
        let channel = self.channel_as(name, Direction::Input)?;
        graph.build()?;
        let collector = graph.metrics().clone();
        let acquisition = self.setup()?;
        if acquisition.inputs.iter().any(|i| i.name == name) {
            bail!("Input {} already configured", name);
        }
        acquisition.inputs.push(InputLine {
            name: name.to_string(),
            channel,
            graph,
            writer: None,
            publish: false,
            out_of_range: false,
        });
        self.collectors.insert(name.to_string(), collector);
        Ok(())
    }

    /// Record an input's raw samples to a continuous store
    pub fn record(&mut self, input: &str, path: impl AsRef<Path>) -> Result<()> {
        let acquisition = self.setup()?;
        let line = acquisition
            .inputs
            .iter_mut()
            .find(|i| i.name == input)
            .ok_or_else(|| anyhow!("Input {} is not configured", input))?;
        line.writer = Some(ContinuousWriter::create(path, line.channel.fs, 1)?);
        Ok(())
    }

    pub fn add_extractor(&mut self, binding: ExtractorBinding) -> Result<()> {
        let acquisition = self.setup()?;
        if acquisition.extractors.iter().any(|e| e.name == binding.name) {
            bail!("Duplicate extractor name: {}", binding.name);
        }
        let input = acquisition
            .inputs
            .iter_mut()
            .find(|i| i.name == binding.input)
            .ok_or_else(|| anyhow!("Extractor {} reads unknown input {}", binding.name, binding.input))?;
        if let Some(stage) = &binding.source {
            input.graph.tap(stage)?;
        }
        let fs = binding.fs.unwrap_or(input.channel.fs);
        if !(fs > 0.0) {
            bail!("Extractor {} has invalid sample rate {}", binding.name, fs);
        }

        let output = acquisition
            .outputs
            .iter_mut()
            .find(|o| o.name == binding.output)
            .ok_or_else(|| anyhow!("Extractor {} follows unknown output {}", binding.name, binding.output))?;
        let mut extractor = EpochExtractor::new(fs, &binding.config);
        extractor.connect(&mut output.queue);
        let lead = (binding.config.prestim * output.channel.fs).ceil().max(0.0) as u64;
        output.lead = output.lead.max(lead);
        let counts_trials = !output.queue.auto_decrement()
            && !acquisition.extractors.iter().any(|e| e.output == binding.output);

        acquisition.extractors.push(ExtractorLine {
            name: binding.name,
            input: binding.input,
            output: binding.output,
            source: binding.source,
            extractor,
            counts_trials,
        });
        Ok(())
    }

    pub fn appender(&self, output: &str) -> Result<QueueAppender> {
        self.appenders
            .get(output)
            .cloned()
            .ok_or_else(|| anyhow!("Output {} has no queue", output))
    }

    /// Called by the `<output>.prepare_queue` command
    pub fn on_prepare_queue(
        &mut self,
        output: &str,
        prepare: impl FnMut(&QueueAppender, &Channel) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        if !self.appenders.contains_key(output) {
            bail!("Output {} has no queue", output);
        }
        self.preparers.insert(output.to_string(), Box::new(prepare));
        Ok(())
    }

    pub fn subscribe(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(&KernelEvent) + Send + 'static,
    ) {
        self.bus.subscribe(name, handler);
    }

    /// Run a `<target>.<action>` command
    pub fn invoke(&mut self, command: &str) -> Result<()> {
        let command: Command = command.parse()?;
        let target = command.target().to_string();
        if !self.appenders.contains_key(&target) {
            bail!("Command {:?} targets unknown output {}", command, target);
        }
        tracing::debug!(?command, "invoking command");

        match command {
            Command::PrepareQueue(output) => {
                let appender = self.appender(&output)?;
                let channel = self.channel(&output)?.clone();
                let prepare = self
                    .preparers
                    .get_mut(&output)
                    .ok_or_else(|| anyhow!("No queue preparation registered for {}", output))?;
                prepare(&appender, &channel)
            }
            Command::Start(output) => self.send_or_apply(output, true),
            Command::Pause(output) => self.send_or_apply(output, false),
        }
    }

    fn send_or_apply(&mut self, output: String, active: bool) -> Result<()> {
        if let Some(acquisition) = self.acquisition.as_mut() {
            acquisition.set_active(&output, active);
            return Ok(());
        }
        let command = if active {
            LoopCommand::Start(output)
        } else {
            LoopCommand::Pause(output)
        };
        self.send(command)
    }

    fn send(&self, command: LoopCommand) -> Result<()> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| anyhow!("Acquisition loop is not running"))?
            .send(command)
            .map_err(|_| anyhow!("Acquisition loop has exited"))
    }

    /// Configure the engine and start acquiring
    pub async fn start(&mut self) -> Result<()> {
        self.state.advance(KernelState::Initializing)?;
        match self.launch().await {
            Ok(()) => {
                self.started_at = Some(Instant::now());
                self.state.advance(KernelState::Running {
                    since: self.started_at,
                })?;
                tracing::info!(engine = self.engine.name(), "acquisition started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "acquisition failed to start");
                if let Some(tx) = self.command_tx.take() {
                    let _ = tx.send(LoopCommand::Stop);
                }
                if let Some(worker) = self.worker.take() {
                    if let Ok(acquisition) = worker.await {
                        self.acquisition = Some(acquisition);
                    }
                }
                if let Err(stop_error) = self.engine.stop().await {
                    tracing::warn!(error = %stop_error, "engine did not stop cleanly");
                }
                self.state.advance(KernelState::Error {
                    message: e.to_string(),
                })?;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<()> {
        self.engine.configure(self.engine_config.clone()).await?;
        let channels = self.engine.get_channels()?;

        let mut acquisition = self
            .acquisition
            .take()
            .ok_or_else(|| anyhow!("Acquisition is not available"))?;
        for input in acquisition.inputs.iter_mut() {
            input.publish = self.bus.has_subscribers(&format!("{}_acquired", input.name));
        }

        let (events_tx, events_rx) = bounded(self.event_capacity);
        let (command_tx, command_rx) = unbounded();
        self.events_rx = Some(events_rx);
        self.command_tx = Some(command_tx);
        self.worker = Some(tokio::task::spawn_blocking(move || {
            acquisition.run(channels, events_tx, command_rx)
        }));

        self.engine.start().await
    }

    /// Silence every output while inputs keep acquiring
    pub fn pause(&mut self) -> Result<()> {
        self.state.advance(KernelState::Paused {
            since: Some(Instant::now()),
        })?;
        self.send(LoopCommand::Hold(true))
    }

    pub fn resume(&mut self) -> Result<()> {
        self.state.advance(KernelState::Running {
            since: self.started_at,
        })?;
        self.send(LoopCommand::Hold(false))
    }

    /// Deliver pending events to subscribers without blocking
    pub fn dispatch(&mut self) -> usize {
        let Some(events) = self.events_rx.clone() else {
            return 0;
        };
        let mut delivered = 0;
        while let Ok(event) = events.try_recv() {
            self.deliver(event);
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for at least one event, then deliver everything
    /// pending
    pub fn dispatch_timeout(&mut self, timeout: Duration) -> usize {
        let Some(events) = self.events_rx.clone() else {
            return 0;
        };
        match events.recv_timeout(timeout) {
            Ok(event) => {
                self.deliver(event);
                1 + self.dispatch()
            }
            Err(_) => 0,
        }
    }

    fn deliver(&mut self, event: KernelEvent) {
        match &event {
            KernelEvent::Complete { output } => {
                self.completed.insert(output.clone());
            }
            KernelEvent::Error { message } => self.last_error = Some(message.clone()),
            KernelEvent::Stopped { samples_acquired } => self.samples_acquired = *samples_acquired,
            _ => {}
        }
        self.bus.publish(&event);
    }

    pub fn is_complete(&self, output: &str) -> bool {
        self.completed.contains(output)
    }

    /// Every output with a queue has completed
    pub fn all_complete(&self) -> bool {
        !self.appenders.is_empty() && self.appenders.keys().all(|o| self.completed.contains(o))
    }

    /// Dispatch events until every output completes
    pub async fn run_until_complete(&mut self, timeout: Duration) -> Result<()> {
        if self.appenders.is_empty() {
            bail!("No outputs to wait for");
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.dispatch();
            if self.all_complete() {
                return Ok(());
            }
            if self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(true) {
                self.dispatch();
                if self.all_complete() {
                    return Ok(());
                }
                let reason = self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "acquisition loop exited".to_string());
                bail!("Acquisition ended before completion: {}", reason);
            }
            if Instant::now() >= deadline {
                bail!("Acquisition did not complete within {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop the loop and the engine; outstanding epoch windows are discarded
    pub async fn stop(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Ok(());
        }

        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(LoopCommand::Stop);
        }
        if let Some(worker) = self.worker.take() {
            match worker.await {
                Ok(acquisition) => self.acquisition = Some(acquisition),
                Err(e) => tracing::error!(error = %e, "acquisition loop panicked"),
            }
        }
        if let Err(e) = self.engine.stop().await {
            tracing::error!(engine = self.engine.name(), error = %e, "failed to stop engine");
        }
        self.dispatch();
        self.events_rx = None;

        let target = match self.last_error.clone() {
            Some(message) => KernelState::Error { message },
            None => KernelState::Completed {
                elapsed: self.started_at.map(|t| t.elapsed()),
                samples_acquired: self.samples_acquired,
            },
        };
        self.state.advance(target)?;
        tracing::info!(samples = self.samples_acquired, "acquisition stopped");
        Ok(())
    }

    /// Valid and rejected epoch counts per queue key, once stopped
    pub fn epoch_counts(&self, extractor: &str) -> Option<BTreeMap<u64, EpochCounts>> {
        self.acquisition
            .as_ref()?
            .extractors
            .iter()
            .find(|e| e.name == extractor)
            .map(|e| e.extractor.counts().clone())
    }

    pub fn samples_acquired(&self) -> u64 {
        self.samples_acquired
    }

    /// Stage metrics of every input graph, prefixed with the input name
    pub fn metrics(&self) -> MetricsCollector {
        let mut all = MetricsCollector::new();
        for (input, collector) in &self.collectors {
            all.absorb(input, collector);
        }
        all
    }
}

/// Note: This struct should be stopped via `stop()` before dropping. Drop can
/// only signal the loop; it cannot await the engine.
impl Drop for AcquisitionKernel {
    fn drop(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(LoopCommand::Stop);
        }
    }
}

/// What [`acquire_epochs`] presents and where it listens
#[derive(Debug, Clone, PartialEq)]
pub struct EpochAcquisition {
    pub output: String,
    pub input: String,
    pub policy: QueuePolicy,
    pub extractor: ExtractorConfig,
    pub timeout: Duration,
}

impl EpochAcquisition {
    pub fn new(output: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
            policy: QueuePolicy::Fifo,
            extractor: ExtractorConfig::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Run one complete acquisition: fill the output queue with `prepare`, play
/// it, and collect every accepted epoch from the input in arrival order
pub async fn acquire_epochs(
    engine: Box<dyn Engine>,
    engine_config: EngineConfig,
    plan: &EpochAcquisition,
    prepare: impl FnOnce(&QueueAppender, &Channel) -> Result<()>,
) -> Result<Vec<Epoch>> {
    let mut kernel = AcquisitionKernel::new(engine, engine_config)?;
    let appender = kernel.add_output(&plan.output, plan.policy, true)?;
    kernel.add_input(&plan.input, StageGraph::new())?;

    let name = format!("{}_{}", plan.output, plan.input);
    kernel.add_extractor(
        ExtractorBinding::new(&name, &plan.input, &plan.output).with_config(plan.extractor.clone()),
    )?;
    prepare(&appender, kernel.channel(&plan.output)?)?;

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    kernel.subscribe(format!("{}_epochs", name), move |event| {
        if let KernelEvent::Epochs { epochs, .. } = event {
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend(epochs.iter().cloned());
        }
    });

    kernel.invoke(&format!("{}.start", plan.output))?;
    kernel.start().await?;
    let waited = kernel.run_until_complete(plan.timeout).await;
    kernel.stop().await?;
    waited?;

    let epochs = std::mem::take(&mut *collected.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    Ok(epochs)
}
