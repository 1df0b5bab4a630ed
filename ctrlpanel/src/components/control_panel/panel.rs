use crate::{
    components::control_panel::{
        datalog::{DataLog, DataLogSettings, RotationNotice, Sampler},
        scheduler::DeferredScheduler,
        shell::{CommandRegistry, CommandShell, Invocation, NavContext},
        syscmds::{cmd_help, FileCommands, SystemCommands, VERSION},
    },
    devices::{
        hardware::{
            actuator::ActuatorRegistry,
            sensor::{SensorRegistry, SensorSettings},
        },
        software::{
            clock::{parse_log_date, LogicalClock, DEFAULT_EPOCH},
            storage::{FsLogStore, Medium, SharedLogStore, StorageGuard},
        },
    },
    error::PanelError,
    messages::control::{
        command::{CallerId, CommandMessage, CommandResponse, CommandResult, ExecStatus, Reply},
        record::SourceId,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Period of the clock tick and of the sampler.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Longest gateway request line, newline included.
const MAX_REQUEST_LINE: usize = 1024;

const MALFORMED_REQUEST: &str = "Malformed request";
const LINE_TOO_LONG: &str = "Request line too long";

/// Configuration of a control panel component.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
#[serde(default)]
pub struct ControlPanelConfig {
    /// Port of the line gateway used by the web server.
    port: u16,
    /// Directory holding the `A/LOG` and `B/LOG` log directories.
    log_root: PathBuf,
    /// Log queue capacity.
    queue_capacity: usize,
    /// Queue depth, in percent of the capacity, that wakes the log writer.
    high_watermark_percent: usize,
    /// Queue depth, in percent of the capacity, the log writer drains to.
    low_watermark_percent: usize,
    /// Size in bytes past which a new log file is started.
    max_log_file_size: u64,
    /// Number of deferred command slots.
    scheduler_capacity: usize,
    /// Shortest delay accepted for a deferred command, in seconds.
    min_lead_seconds: i64,
    /// Power-on time, `MM/DD/YY HH:MM:SS`.
    initial_time: Option<String>,
    sensors: HashMap<SourceId, SensorSettings>,
}

impl Default for ControlPanelConfig {
    fn default() -> Self {
        let sampled = SensorSettings {
            lograte: 10,
            ..SensorSettings::default()
        };
        Self {
            port: 8080,
            log_root: PathBuf::from("log"),
            queue_capacity: 30,
            high_watermark_percent: 70,
            low_watermark_percent: 30,
            max_log_file_size: 20_480,
            scheduler_capacity: DeferredScheduler::DEFAULT_CAPACITY,
            min_lead_seconds: DeferredScheduler::MIN_LEAD_SECONDS,
            initial_time: None,
            sensors: [
                SourceId::Temperature,
                SourceId::Potentiometer,
                SourceId::Light,
            ]
            .into_iter()
            .map(|source| (source, sampled))
            .collect(),
        }
    }
}

impl ControlPanelConfig {
    /// Control panel configuration with default queue and scheduler sizes.
    ///
    /// * `port`: gateway port.
    /// * `log_root`: directory the log media live in.
    pub fn new<P: Into<PathBuf>>(port: u16, log_root: P) -> Self {
        Self {
            port,
            log_root: log_root.into(),
            ..Self::default()
        }
    }

    /// Replace the settings of one sensor.
    pub fn with_sensor(mut self, source: SourceId, settings: SensorSettings) -> Self {
        self.sensors.insert(source, settings);
        self
    }

    pub fn with_initial_time(mut self, time: &str) -> Self {
        self.initial_time = Some(time.to_owned());
        self
    }

    pub fn with_max_log_file_size(mut self, size: u64) -> Self {
        self.max_log_file_size = size;
        self
    }

    /// Read a configuration stored in a yaml file.
    ///
    /// * `filepath`: path to the stored parameters.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, PanelError> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(PanelError::MissingConfig(file.display().to_string()));
        }
        let config = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .build()?;
        Ok(config.try_deserialize::<ControlPanelConfig>()?)
    }

    fn data_log_settings(&self) -> DataLogSettings {
        DataLogSettings::from_percentages(
            self.queue_capacity,
            self.high_watermark_percent,
            self.low_watermark_percent,
            self.max_log_file_size,
        )
    }

    fn start_time(&self) -> Result<i64, PanelError> {
        match &self.initial_time {
            Some(time) => {
                parse_log_date(time).ok_or_else(|| PanelError::InvalidInitialTime(time.clone()))
            }
            None => Ok(DEFAULT_EPOCH),
        }
    }
}

/// The control panel: command shell, deferred command scheduler and data log
/// wired to the board's sensors and actuators.
pub struct ControlPanel {
    /// Unique identifier for the component.
    uuid: Uuid,
    port: u16,
    clock: Arc<LogicalClock>,
    scheduler: Arc<DeferredScheduler>,
    datalog: Arc<DataLog>,
    sensors: Arc<SensorRegistry>,
    actuators: Arc<ActuatorRegistry>,
    store: SharedLogStore,
    storage_guard: StorageGuard,
    shell: Arc<CommandShell>,
    sampler: Mutex<Sampler>,
    notices: Option<UnboundedReceiver<RotationNotice>>,
    console: Option<UnboundedReceiver<String>>,
}

impl ControlPanel {
    /// Create a new component from a config struct. The log directories
    /// are created when missing.
    ///
    /// * `config`: struct containing the parameters for configuration.
    pub fn new(config: ControlPanelConfig) -> Result<Self, PanelError> {
        let clock = Arc::new(LogicalClock::new(config.start_time()?));
        let scheduler = Arc::new(DeferredScheduler::new(
            clock.clone(),
            config.scheduler_capacity,
            config.min_lead_seconds,
        ));

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let datalog = Arc::new(
            DataLog::new(config.data_log_settings(), clock.clone()).with_notices(notice_tx),
        );

        let fs_store = FsLogStore::new(&config.log_root);
        fs_store.prepare()?;
        let store = fs_store.shared();
        let storage_guard = StorageGuard::new();

        let sensors = Arc::new(SensorRegistry::board(&config.sensors));
        let actuators = Arc::new(ActuatorRegistry::board());

        let registry = Self::build_registry(
            clock.clone(),
            scheduler.clone(),
            datalog.clone(),
            sensors.clone(),
            actuators.clone(),
            store.clone(),
        );
        let (console_tx, console_rx) = mpsc::unbounded_channel();
        let shell =
            Arc::new(CommandShell::new(registry, storage_guard.clone()).with_console(console_tx));

        Ok(Self {
            uuid: Uuid::new_v4(),
            port: config.port,
            clock,
            scheduler,
            datalog,
            sensors,
            actuators,
            store,
            storage_guard,
            shell,
            sampler: Mutex::new(Sampler::new()),
            notices: Some(notice_rx),
            console: Some(console_rx),
        })
    }

    /// Create a new component by reading the config parameters from a file.
    ///
    /// * `filepath`: path to config file.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, PanelError> {
        Self::new(ControlPanelConfig::from_file(filepath)?)
    }

    /// Verb table of the panel.
    fn build_registry(
        clock: Arc<LogicalClock>,
        scheduler: Arc<DeferredScheduler>,
        datalog: Arc<DataLog>,
        sensors: Arc<SensorRegistry>,
        actuators: Arc<ActuatorRegistry>,
        store: SharedLogStore,
    ) -> CommandRegistry {
        let system = Arc::new(SystemCommands::new(
            clock.clone(),
            scheduler.clone(),
            datalog.clone(),
        ));
        let files = Arc::new(FileCommands::new(store, datalog));
        let everyone = CallerId::all();
        let storage_users = CallerId::CONSOLE | CallerId::USB;

        CommandRegistry::new(CallerId::CONSOLE)
            .command("get_sensor_value", everyone, {
                let (sensors, clock) = (sensors.clone(), clock.clone());
                move |inv: &Invocation<'_>| sensors.cmd_get_value(&clock, inv.args)
            })
            .command("get_sensor_config", everyone, {
                let sensors = sensors.clone();
                move |inv: &Invocation<'_>| sensors.cmd_get_config(inv.args)
            })
            .command("set_sensor_config", everyone, move |inv: &Invocation<'_>| {
                sensors.cmd_set_config(inv.args)
            })
            .command("get_actuator_value", everyone, {
                let actuators = actuators.clone();
                move |inv: &Invocation<'_>| actuators.cmd_get_value(&clock, inv.args)
            })
            .command("set_actuator_value", everyone, move |inv: &Invocation<'_>| {
                actuators.cmd_set_value(&scheduler, inv.args)
            })
            .command("get_sys_config", everyone, {
                let system = system.clone();
                move |inv: &Invocation<'_>| system.cmd_get_config(inv.args)
            })
            .command("set_sys_config", everyone, move |inv: &Invocation<'_>| {
                system.cmd_set_config(inv.args)
            })
            .storage_command("ls", storage_users, {
                let files = files.clone();
                move |inv: &Invocation<'_>| files.cmd_ls(inv)
            })
            .storage_command("cat", storage_users, {
                let files = files.clone();
                move |inv: &Invocation<'_>| files.cmd_cat(inv)
            })
            .storage_command("rm", storage_users, {
                let files = files.clone();
                move |inv: &Invocation<'_>| files.cmd_rm(inv)
            })
            .storage_command("a:", storage_users, {
                let files = files.clone();
                move |inv: &Invocation<'_>| files.cmd_change_drive(inv, Medium::DataFlash)
            })
            .storage_command("b:", storage_users, move |inv: &Invocation<'_>| {
                files.cmd_change_drive(inv, Medium::SdCard)
            })
            .command("help", everyone, |inv: &Invocation<'_>| cmd_help(inv.args))
            .command("version", CallerId::CONSOLE, |_: &Invocation<'_>| Ok(Reply::Static(VERSION)))
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<DeferredScheduler> {
        &self.scheduler
    }

    pub fn datalog(&self) -> &Arc<DataLog> {
        &self.datalog
    }

    pub fn sensors(&self) -> &Arc<SensorRegistry> {
        &self.sensors
    }

    pub fn actuators(&self) -> &Arc<ActuatorRegistry> {
        &self.actuators
    }

    pub fn storage_guard(&self) -> &StorageGuard {
        &self.storage_guard
    }

    pub fn store(&self) -> &SharedLogStore {
        &self.store
    }

    pub fn shell(&self) -> &Arc<CommandShell> {
        &self.shell
    }

    /// Run a command line without navigation context.
    pub fn execute(&self, line: String, caller: CallerId) -> CommandResult {
        self.shell.execute(line, caller, None)
    }

    /// One clock tick: advance the logical clock a second and fire at most
    /// one due deferred command.
    pub fn tick(&self) -> bool {
        let now = self.clock.advance();
        self.scheduler
            .tick(now, |command| self.actuators.fire(command))
    }

    /// One sampler period. Returns how many samples were queued.
    pub fn sample(&self) -> usize {
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        sampler.on_second(&self.datalog, &self.sensors)
    }
}

/// Unit struct for adding controlling behaviour to the control panel.
pub struct ControlPanelController;

impl ControlPanelController {
    /// Start the control panel component: clock tick, sampler, log writer,
    /// rotation notices, console and the line gateway.
    ///
    /// * `control_panel`: component
    pub async fn start(mut control_panel: ControlPanel) -> Result<(), PanelError> {
        let listener = TcpListener::bind(("0.0.0.0", control_panel.port)).await?;
        info!(uuid = %control_panel.uuid, port = control_panel.port, "control panel started");

        let notices = control_panel.notices.take();
        let console_output = control_panel.console.take();
        let panel = Arc::new(control_panel);

        let ticking = panel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            loop {
                interval.tick().await;
                ticking.tick();
            }
        });

        let sampling = panel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            loop {
                interval.tick().await;
                sampling.sample();
            }
        });

        tokio::spawn(
            panel
                .datalog
                .clone()
                .run_writer(panel.store.clone(), panel.storage_guard.clone()),
        );

        if let Some(mut notices) = notices {
            tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    info!(
                        previous = %notice.previous.display(),
                        current = %notice.current.display(),
                        "log file rotated, previous file ready to be mailed"
                    );
                }
            });
        }

        if let Some(mut output) = console_output {
            tokio::spawn(async move {
                let mut stdout = tokio::io::stdout();
                while let Some(text) = output.recv().await {
                    if stdout.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
            });
        }

        tokio::spawn(run_console(panel.clone()));

        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(%peer, "gateway connection");
                    let connection = panel.clone();
                    tokio::spawn(async move {
                        handle_connection(socket, connection).await;
                    });
                }
                Err(err) => warn!(%err, "gateway accept failed"),
            }
        }
    }
}

/// Read console lines from stdin and run them as the console identity. The
/// console keeps one navigation context for its whole session.
async fn run_console(panel: Arc<ControlPanel>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let nav = NavContext::default();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(text) = console_reply(&panel, &nav, line) {
            panel.shell.route_to_requester(CallerId::CONSOLE, &text);
        }
    }
    debug!("console input closed");
}

/// Run one console line. Returns the text to show, if any.
fn console_reply(panel: &ControlPanel, nav: &NavContext, line: String) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }
    match panel.shell.execute(line, CallerId::CONSOLE, Some(nav)) {
        Ok(reply) => reply.text().map(str::to_owned),
        Err(err) => Some(format!("Error\r\n{err}\r\n")),
    }
}

/// Outcome of reading one gateway request.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Line,
    TooLong,
    Closed,
}

/// Read one request line of at most `MAX_REQUEST_LINE` bytes into `data`.
/// The rest of an overlong line is skipped.
async fn read_request<R>(reader: &mut R, data: &mut Vec<u8>) -> io::Result<Request>
where
    R: AsyncBufRead + Unpin,
{
    data.clear();
    let limit = MAX_REQUEST_LINE as u64;
    if (&mut *reader).take(limit).read_until(b'\n', data).await? == 0 {
        return Ok(Request::Closed);
    }
    if data.len() < MAX_REQUEST_LINE || data.ends_with(b"\n") {
        return Ok(Request::Line);
    }
    let mut skipped = Vec::new();
    loop {
        skipped.clear();
        let read = (&mut *reader).take(limit).read_until(b'\n', &mut skipped).await?;
        if read == 0 || skipped.ends_with(b"\n") {
            return Ok(Request::TooLong);
        }
    }
}

fn failed(message: &str) -> CommandResponse {
    CommandResponse {
        status: ExecStatus::Failed,
        response: Some(message.to_owned()),
    }
}

/// Serve one gateway connection: a JSON command per line in, a JSON
/// response per line out, executed as the HTTP identity.
///
/// * `socket`: `TcpStream`
/// * `panel`: component
async fn handle_connection(socket: TcpStream, panel: Arc<ControlPanel>) {
    let (read_stream, mut write_stream) = socket.into_split();
    let mut read_stream = BufReader::new(read_stream);
    let mut data = Vec::new();

    loop {
        let response = match read_request(&mut read_stream, &mut data).await {
            Ok(Request::Closed) => break,
            Ok(Request::TooLong) => {
                warn!(limit = MAX_REQUEST_LINE, "gateway request line too long");
                failed(LINE_TOO_LONG)
            }
            Ok(Request::Line) => match serde_json::from_slice::<CommandMessage>(&data) {
                Ok(message) => CommandResponse::from(&panel.execute(message.line, CallerId::HTTP)),
                Err(err) => {
                    warn!(%err, "received a malformed gateway request");
                    failed(MALFORMED_REQUEST)
                }
            },
            Err(err) => {
                debug!(%err, "gateway read failed");
                break;
            }
        };
        let mut body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "gateway response encoding failed");
                break;
            }
        };
        body.push(b'\n');
        if write_stream.write_all(&body).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::CommandError, fixture_path, utils::tests::fixture_output};
    use serial_test::serial;
    use std::fs::OpenOptions;

    fn panel(dir: &tempfile::TempDir) -> ControlPanel {
        let config = ControlPanelConfig::new(0, dir.path()).with_sensor(
            SourceId::Temperature,
            SensorSettings {
                lograte: 2,
                ..SensorSettings::default()
            },
        );
        ControlPanel::new(config).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ControlPanelConfig::default();
        let settings = config.data_log_settings();
        assert_eq!(settings.queue_capacity, 30);
        assert_eq!(settings.high_watermark, 21);
        assert_eq!(settings.low_watermark, 9);
        assert_eq!(config.start_time().unwrap(), DEFAULT_EPOCH);
        assert_eq!(config.sensors.len(), 3);
    }

    #[test]
    fn test_read_config_fixture() {
        let config = ControlPanelConfig::from_file(fixture_path!(
            "/config/components/control_panel/control_panel.yaml"
        ))
        .unwrap();
        assert_eq!(config.port, 17660);
        assert_eq!(config.queue_capacity, 30);
        assert_eq!(config.max_log_file_size, 20_480);
        assert_eq!(config.initial_time.as_deref(), Some("04/03/07 00:00:00"));
        assert_eq!(config.sensors[&SourceId::Temperature].lograte, 5);
        assert_eq!(config.sensors[&SourceId::Temperature].max, Some(40));
        assert!(config.sensors[&SourceId::PushButton1].alarm);
    }

    #[test]
    #[serial]
    fn test_read_write_config() {
        let write_config = ControlPanelConfig::new(17661, "/var/lib/ctrlpanel")
            .with_initial_time("10/31/06 11:32:53")
            .with_max_log_file_size(4096)
            .with_sensor(
                SourceId::Light,
                SensorSettings {
                    lograte: 1,
                    min: Some(10),
                    max: Some(90),
                    alarm: false,
                },
            );
        let path = fixture_output("config/components/control_panel/control_panel_written.yaml");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("Failed to open file");
        serde_yaml::to_writer(file, &write_config).expect("Failed to write yaml");

        let read_config = ControlPanelConfig::from_file(&path).unwrap();
        assert_eq!(write_config, read_config, "Failed to read write config");
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            ControlPanelConfig::from_file("/nonexistent/control_panel.yaml"),
            Err(PanelError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_invalid_initial_time() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlPanelConfig::new(0, dir.path()).with_initial_time("someday");
        assert!(matches!(
            ControlPanel::new(config),
            Err(PanelError::InvalidInitialTime(_))
        ));
    }

    #[test]
    fn test_deferred_actuator_set_fires_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(&dir);
        assert_eq!(
            panel.execute(
                "set_actuator_value actuator=ledb2 green=10 red=20 time=3".into(),
                CallerId::HTTP
            ),
            Ok(Reply::Empty)
        );
        assert!(!panel.tick());
        assert!(!panel.tick());
        assert!(panel.tick());
        assert_eq!(
            panel.execute("get_actuator_value actuator=ledb2".into(), CallerId::HTTP),
            Ok(Reply::Owned("ledb2 | 04/03/07 00:00:03 | 10,20\r\n".into()))
        );
    }

    #[test]
    fn test_clock_step_cancels_deferred_sets() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(&dir);
        panel
            .execute("set_actuator_value actuator=ledm1 state=on time=10".into(), CallerId::CONSOLE)
            .unwrap();
        panel
            .execute("set_actuator_value actuator=ledm2 state=on time=30".into(), CallerId::CONSOLE)
            .unwrap();
        panel
            .execute(
                "set_sys_config sys=time curtime=\"04/03/07 00:00:20\"".into(),
                CallerId::HTTP,
            )
            .unwrap();
        assert_eq!(panel.scheduler().deadlines(), vec![DEFAULT_EPOCH + 30]);
        assert_eq!(panel.clock().now(), DEFAULT_EPOCH + 20);
    }

    #[test]
    fn test_permissions_of_the_panel_verbs() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(&dir);
        assert_eq!(
            panel.execute("ls".into(), CallerId::HTTP),
            Err(CommandError::PermissionDenied)
        );
        assert!(panel.execute("ls".into(), CallerId::USB).is_ok());
        assert_eq!(
            panel.execute("version".into(), CallerId::HTTP),
            Err(CommandError::PermissionDenied)
        );
        assert_eq!(
            panel.execute("version".into(), CallerId::CONSOLE),
            Ok(Reply::Static(VERSION))
        );
        assert_eq!(
            panel.execute("reboot".into(), CallerId::CONSOLE),
            Err(CommandError::NotFound)
        );
    }

    #[test]
    fn test_storage_verbs_busy_while_guard_held() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(&dir);
        let token = panel.storage_guard().try_acquire().unwrap();
        assert_eq!(
            panel.execute("ls".into(), CallerId::CONSOLE),
            Err(CommandError::ResourceBusy)
        );
        drop(token);
        assert!(panel.execute("ls".into(), CallerId::CONSOLE).is_ok());
    }

    #[test]
    fn test_sampler_follows_lograte() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(&dir);
        // temp every 2 seconds, pot and light every 10.
        let queued: Vec<_> = (0..10).map(|_| panel.sample()).collect();
        assert_eq!(queued, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 3]);
        assert_eq!(panel.datalog().depth(), 7);
    }

    #[test]
    fn test_repeat_from_console() {
        let dir = tempfile::tempdir().unwrap();
        let mut panel = panel(&dir);
        let mut console = panel.console.take().unwrap();
        panel
            .sensors()
            .analog(SourceId::Potentiometer)
            .unwrap()
            .set_reading(42);
        let first = panel
            .shell()
            .execute("get_sensor_value sensor=pot".into(), CallerId::CONSOLE, None);
        let again = panel.shell().execute("!!".into(), CallerId::CONSOLE, None);
        assert_eq!(first, again);
        assert_eq!(
            console.try_recv().unwrap(),
            "get_sensor_value sensor pot\r\n"
        );
        assert_eq!(
            panel.execute("!!".into(), CallerId::HTTP),
            Err(CommandError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_gateway_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(panel(&dir));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let serving = panel.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_connection(socket, serving).await;
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(b"{\"line\":\"set_actuator_value actuator=lcd usrmsg=\\\"hi there\\\"\"}\n{\"line\":\"get_actuator_value actuator=lcd\"}\nnot json\n{\"line\":\"ls\"}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(client).lines();
        let mut responses = Vec::new();
        for _ in 0..4 {
            let line = lines.next_line().await.unwrap().unwrap();
            responses.push(serde_json::from_str::<CommandResponse>(&line).unwrap());
        }
        assert_eq!(responses[0].status, ExecStatus::OkNoRelease);
        assert_eq!(responses[1].status, ExecStatus::Ok);
        assert_eq!(
            responses[1].response.as_deref(),
            Some("lcd | 04/03/07 00:00:00 | hi there\r\n")
        );
        assert_eq!(responses[2].status, ExecStatus::Failed);
        assert_eq!(responses[3].response.as_deref(), Some("Permission denied"));
    }

    #[test]
    fn test_console_drive_navigation() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(&dir);
        std::fs::write(
            dir.path().join("B").join("LOG").join("040307_0000.log"),
            "js | 04/03/07 00:00:00 | UP\r\n",
        )
        .unwrap();
        panel
            .execute("set_sys_config sys=log drive=b".into(), CallerId::CONSOLE)
            .unwrap();

        let nav = NavContext::default();
        assert_eq!(console_reply(&panel, &nav, "ls".into()), Some(String::new()));
        assert_eq!(console_reply(&panel, &nav, "b:".into()), None);
        assert_eq!(nav.drive(), Medium::SdCard);
        assert_eq!(
            console_reply(&panel, &nav, "ls".into()),
            Some("      29 040307_0000.log\r\n".into())
        );
        assert_eq!(console_reply(&panel, &nav, "a:".into()), None);
        assert_eq!(console_reply(&panel, &nav, "ls".into()), Some(String::new()));
        assert_eq!(
            console_reply(&panel, &nav, "c:".into()),
            Some("Error\r\nCommand not found\r\n".into())
        );
        assert_eq!(console_reply(&panel, &nav, "  ".into()), None);
        assert_eq!(
            panel.execute("b:".into(), CallerId::HTTP),
            Err(CommandError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_read_request_skips_overlong_lines() {
        let input = format!(
            "{{\"line\":\"help\"}}\n{}\nversion\n",
            "x".repeat(MAX_REQUEST_LINE * 2)
        );
        let mut reader = input.as_bytes();
        let mut data = Vec::new();
        assert_eq!(read_request(&mut reader, &mut data).await.unwrap(), Request::Line);
        assert_eq!(data, b"{\"line\":\"help\"}\n");
        assert_eq!(read_request(&mut reader, &mut data).await.unwrap(), Request::TooLong);
        assert_eq!(read_request(&mut reader, &mut data).await.unwrap(), Request::Line);
        assert_eq!(data, b"version\n");
        assert_eq!(read_request(&mut reader, &mut data).await.unwrap(), Request::Closed);
    }

    #[tokio::test]
    async fn test_gateway_rejects_overlong_line() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(panel(&dir));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_connection(socket, panel).await;
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        let request = format!(
            "{{\"line\":\"{}\"}}\n{{\"line\":\"get_actuator_value actuator=ledm1\"}}\n",
            "y".repeat(MAX_REQUEST_LINE)
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut lines = BufReader::new(client).lines();

        let line = lines.next_line().await.unwrap().unwrap();
        let rejected = serde_json::from_str::<CommandResponse>(&line).unwrap();
        assert_eq!(rejected, failed(LINE_TOO_LONG));

        let line = lines.next_line().await.unwrap().unwrap();
        let answered = serde_json::from_str::<CommandResponse>(&line).unwrap();
        assert_eq!(answered.status, ExecStatus::Ok);
        assert_eq!(
            answered.response.as_deref(),
            Some("ledm1 | 04/03/07 00:00:00 | off\r\n")
        );
    }
}
