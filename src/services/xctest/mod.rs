//! XCTest orchestration (the most intricate adapter).
//!
//! Running a UI test involves three cooperating DTX tunnels and one AFC upload:
//!
//! 1. An Instruments "remote server" tunnel launches the test runner app with
//!    [`crate::services::dvt::process_control`].
//! 2. A `testmanagerd` "control" tunnel negotiates the test session; which selector it speaks
//!    depends on the device's `ProductVersion` ([`version::control_session_call_for`]).
//! 3. A second `testmanagerd` "execution" tunnel is hung off the control session once the test
//!    runner process signals it is alive, and drives `startExecutingTestPlan`.
//!
//! Before any of that, the runner's `XCTestConfiguration` plist is archived and uploaded into the
//! target app's container over [`crate::services::house_arrest`] + AFC, the same way Xcode itself
//! stages a test run.

pub mod version;

use plist::{Dictionary, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::archive::{self, Archivable};
use crate::provider::IdeviceProvider;
use crate::services::dvt::message::AuxValue;
use crate::services::dvt::process_control::ProcessControlClient;
use crate::services::dvt::remote_server::RemoteServerClient;
use crate::services::house_arrest::HouseArrestClient;
use crate::services::lockdown::LockdownClient;
use crate::{obf, IdeviceError, IdeviceService, ReadWrite};

use self::version::{control_session_call_for, ControlSessionCall, DeviceVersion};

/// The selector a testmanagerd control session treats as the "test runner is alive" marker.
const LOG_DEBUG_MESSAGE_SELECTOR: &str = "_XCT_logDebugMessage:";
/// The specific error string the real daemon reports on a successful handoff; anything else on
/// this selector is fatal for the run.
const READY_REPLY_OK: &str = "ReceivedTestRunnerReadyReplyWithError:(null)";

type DtxSocket = Box<dyn ReadWrite>;

/// Everything needed to launch and drive a single XCTest run against one app.
pub struct XCTestSession {
    control: RemoteServerClient<DtxSocket>,
    control_channel: u32,
    execution: Option<RemoteServerClient<DtxSocket>>,
    execution_channel: Option<u32>,
    instruments: RemoteServerClient<DtxSocket>,
    runner_pid: u64,
    device_version: DeviceVersion,
}

/// Parameters describing the test bundle to run, mirroring the fields of a real
/// `XCTestConfiguration` archive.
#[derive(Debug, Clone)]
pub struct XCTestConfiguration {
    pub session_identifier: Uuid,
    pub test_bundle_path: String,
    pub product_module_name: String,
    pub target_application_bundle_id: String,
    pub test_runner_bundle_id: String,
    pub tests_to_run: Vec<String>,
}

impl XCTestConfiguration {
    /// Archives this configuration the way Xcode's own `XCTestConfiguration.plist` is encoded:
    /// a single keyed `Object` with the archiver's expected instance-variable names.
    fn to_archivable(&self) -> Archivable {
        Archivable::Object {
            class_chain: vec!["XCTestConfiguration".to_string(), "NSObject".to_string()],
            members: vec![
                (
                    "sessionIdentifier".to_string(),
                    Archivable::Uuid(self.session_identifier),
                ),
                (
                    "testBundleURL".to_string(),
                    Archivable::Url(format!("file://{}", self.test_bundle_path)),
                ),
                (
                    "productModuleName".to_string(),
                    Archivable::String(self.product_module_name.clone()),
                ),
                (
                    "targetApplicationBundleID".to_string(),
                    Archivable::String(self.target_application_bundle_id.clone()),
                ),
                (
                    "testsToRun".to_string(),
                    Archivable::Set(
                        self.tests_to_run
                            .iter()
                            .cloned()
                            .map(Archivable::String)
                            .collect(),
                    ),
                ),
                ("reportResultsToIDE".to_string(), Archivable::Boolean(true)),
                (
                    "reportActivityStrings".to_string(),
                    Archivable::Boolean(true),
                ),
            ],
        }
    }

    fn plist_file_name(&self) -> String {
        format!("{}.xctestconfiguration", self.session_identifier)
    }
}

async fn connect_testmanagerd(
    provider: &dyn IdeviceProvider,
) -> Result<RemoteServerClient<DtxSocket>, IdeviceError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown
        .start_session(&provider.get_pairing_file().await?, false)
        .await?;

    let try_names = [
        obf!("com.apple.testmanagerd.lockdown.secure"),
        obf!("com.apple.testmanagerd.lockdown"),
    ];
    let mut last_err: Option<IdeviceError> = None;
    for name in try_names {
        match lockdown.start_service(name).await {
            Ok((port, ssl)) => {
                let mut idevice = provider.connect(port).await?;
                if ssl {
                    idevice
                        .upgrade_to_tls(&provider.get_pairing_file().await?, false)
                        .await?;
                }
                let socket = idevice
                    .get_socket()
                    .ok_or(IdeviceError::NoEstablishedConnection)?;
                return Ok(RemoteServerClient::new(socket));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(IdeviceError::ServiceNotFound))
}

async fn fetch_device_version(provider: &dyn IdeviceProvider) -> Result<DeviceVersion, IdeviceError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    let value = lockdown.get_value(Some("ProductVersion"), None).await?;
    let version = value.as_string().ok_or(IdeviceError::UnexpectedResponse)?;
    DeviceVersion::parse(version)
}

impl XCTestSession {
    /// Uploads the test configuration into the runner app's container, launches the runner, and
    /// negotiates the control session. The run is not yet executing tests after this returns;
    /// call [`Self::start_executing_test_plan`] once the caller is ready.
    pub async fn launch(
        provider: &dyn IdeviceProvider,
        config: &XCTestConfiguration,
    ) -> Result<Self, IdeviceError> {
        Self::upload_configuration(provider, config).await?;

        let device_version = fetch_device_version(provider).await?;

        let mut instruments =
            <RemoteServerClient<DtxSocket> as IdeviceService>::connect(provider).await?;
        let runner_pid = Self::launch_runner(&mut instruments, config).await?;

        let mut control = connect_testmanagerd(provider).await?;
        let control_channel = {
            let channel = control
                .make_channel(obf!(
                    "dtxproxy:XCTestManager_IDEInterface:XCTestManager_DaemonConnectionInterface"
                ))
                .await?;
            channel.code()
        };

        Self::initiate_control_session(&mut control, control_channel, runner_pid, device_version)
            .await?;

        Ok(Self {
            control,
            control_channel,
            execution: None,
            execution_channel: None,
            instruments,
            runner_pid,
            device_version,
        })
    }

    async fn upload_configuration(
        provider: &dyn IdeviceProvider,
        config: &XCTestConfiguration,
    ) -> Result<(), IdeviceError> {
        let bytes = archive::encode(config.to_archivable())?;

        let house_arrest = HouseArrestClient::connect(provider).await?;
        let mut afc = house_arrest
            .vend_container(&config.test_runner_bundle_id)
            .await?;

        let path = format!("/tmp/{}", config.plist_file_name());
        let mut file = afc
            .open(&path, crate::services::afc::opcode::AfcFopenMode::WrOnly)
            .await?;
        file.write(&bytes).await?;
        file.close().await?;

        Ok(())
    }

    async fn launch_runner(
        instruments: &mut RemoteServerClient<DtxSocket>,
        config: &XCTestConfiguration,
    ) -> Result<u64, IdeviceError> {
        let mut process_control = ProcessControlClient::new(instruments).await?;

        let mut env = Dictionary::new();
        env.insert(
            "XCTestConfigurationFilePath".into(),
            Value::String(format!("/tmp/{}", config.plist_file_name())),
        );

        let pid = process_control
            .launch_app(
                config.test_runner_bundle_id.clone(),
                Some(env),
                None,
                false,
                true,
            )
            .await?;
        Ok(pid)
    }

    async fn initiate_control_session(
        control: &mut RemoteServerClient<DtxSocket>,
        channel: u32,
        runner_pid: u64,
        device_version: DeviceVersion,
    ) -> Result<(), IdeviceError> {
        let call = control_session_call_for(device_version);
        debug!("testmanagerd control session via {}", call.selector());

        let args = match call {
            ControlSessionCall::InitiateControlSessionForTestProcessId => {
                vec![AuxValue::U32(runner_pid as u32)]
            }
            ControlSessionCall::InitiateControlSessionForTestProcessIdProtocolVersion => {
                vec![AuxValue::U32(runner_pid as u32), AuxValue::U32(36)]
            }
            ControlSessionCall::InitiateSessionWithIdentifierForClient => {
                vec![
                    AuxValue::archived_value(Uuid::new_v4().to_string()),
                    AuxValue::archived_value("ideInterfaceVersion: 30"),
                ]
            }
            ControlSessionCall::AuthorizeTestSession => vec![AuxValue::U32(runner_pid as u32)],
        };

        control
            .call_method(
                channel,
                Some(Value::String(call.selector().to_string())),
                Some(args),
                true,
            )
            .await?;

        let res = control.read_message(channel).await?;
        match res.data {
            Some(Value::Boolean(true)) | None => Ok(()),
            Some(Value::Boolean(false)) => Err(IdeviceError::XCTestRunnerFailed(
                "control session authorization refused".to_string(),
            )),
            Some(other) => {
                warn!("unexpected control session reply: {other:?}");
                Ok(())
            }
        }
    }

    /// Blocks until the test runner announces itself ready (`_XCT_logDebugMessage:` with the
    /// `ReceivedTestRunnerReadyReplyWithError:(null)` marker), then opens the execution tunnel and
    /// kicks off the test plan.
    pub async fn wait_for_runner_ready_and_start(
        &mut self,
        provider: &dyn IdeviceProvider,
    ) -> Result<(), IdeviceError> {
        loop {
            let msg = self.control.read_message(self.control_channel).await?;
            let Some(Value::String(selector)) = &msg.data else {
                continue;
            };
            if selector != LOG_DEBUG_MESSAGE_SELECTOR {
                continue;
            }

            let text = msg
                .aux
                .as_ref()
                .and_then(|aux| aux.values.first())
                .and_then(|v| match v {
                    AuxValue::Array(bytes) => archive::decode(bytes).ok(),
                    _ => None,
                })
                .and_then(|v| v.as_string().map(str::to_string))
                .unwrap_or_default();

            if text.contains(READY_REPLY_OK) {
                break;
            } else if text.contains("ReceivedTestRunnerReadyReplyWithError:") {
                return Err(IdeviceError::XCTestRunnerFailed(text));
            }
        }

        let mut execution = connect_testmanagerd(provider).await?;
        let execution_channel = {
            let channel = execution
                .make_channel(obf!(
                    "dtxproxy:XCTestManager_IDEInterface:XCTestManager_DaemonConnectionInterface"
                ))
                .await?;
            channel.code()
        };

        execution
            .call_method(
                execution_channel,
                Some(Value::String("startExecutingTestPlanWithProtocolVersion:".to_string())),
                Some(vec![AuxValue::U32(36)]),
                false,
            )
            .await?;

        self.execution = Some(execution);
        self.execution_channel = Some(execution_channel);
        Ok(())
    }

    /// Cancels the run: closes both DTX tunnels, kills the launched process, and drops the
    /// Instruments connection. Matches `stop()` on every other long-lived adapter.
    pub async fn cancel(mut self) -> Result<(), IdeviceError> {
        let mut process_control = ProcessControlClient::new(&mut self.instruments).await?;
        if let Err(e) = process_control.kill_app(self.runner_pid).await {
            warn!("failed to kill test runner pid {}: {e}", self.runner_pid);
        }
        Ok(())
    }

    pub fn runner_pid(&self) -> u64 {
        self.runner_pid
    }

    pub fn device_version(&self) -> DeviceVersion {
        self.device_version
    }
}
