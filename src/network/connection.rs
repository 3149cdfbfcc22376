//! Connection establishment and identity verification

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::core::{Config, Error, PeerId, Result};
use crate::protocol::{ControllerState, StateMachine};
use super::Transport;

/// Writes an identity key into the local device
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, key: &[u8]) -> Result<()>;
}

/// Provisions by running an external command
///
/// Every `{key}` in the argument template is replaced with the base64 key.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandProvisioner {
    /// Returns `None` for an empty template
    pub fn new(argv: Vec<String>, timeout: Duration) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(CommandProvisioner { argv, timeout })
        }
    }

    /// Builds the provisioner described by the security settings
    pub fn from_config(config: &Config) -> Option<Self> {
        Self::new(
            config.security.provision_command.clone(),
            config.security.provision_timeout,
        )
    }

    fn render(&self, key: &[u8]) -> Vec<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        self.argv.iter().map(|arg| arg.replace("{key}", &encoded)).collect()
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, key: &[u8]) -> Result<()> {
        let argv = self.render(key);
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => return Err(Error::config("empty provisioning command")),
        };

        info!(program = %program, "Running provisioning command");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| Error::identity_mismatch(format!("provisioning timed out after {:?}", self.timeout)))??;

        if output.status.success() {
            debug!("Provisioning command succeeded");
            Ok(())
        } else {
            Err(Error::identity_mismatch(format!(
                "provisioning command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Checks the device key against the expected one
///
/// With no expected key every device is accepted.
pub fn verify_identity(transport: &dyn Transport, expected: Option<&[u8]>) -> Result<()> {
    let expected = match expected {
        Some(key) => key,
        None => return Ok(()),
    };

    match transport.local_identity() {
        Some(actual) if actual == expected => Ok(()),
        Some(_) => Err(Error::identity_mismatch("device key differs from configured key")),
        None => Err(Error::identity_mismatch("device reported no key")),
    }
}

/// Connects and verifies the device, driving the state machine
///
/// Ends in `Ready` on success and in `Error` on any failure. A key mismatch
/// runs the provisioner once, reconnects and verifies again. Any failure after
/// the link came up closes it again, including a state change made by another
/// task (such as shutdown) while the link was being set up.
pub async fn establish(
    transport: &Arc<dyn Transport>,
    provisioner: Option<&dyn Provisioner>,
    config: &Config,
    state: &StateMachine,
) -> Result<PeerId> {
    state.transition(ControllerState::Connecting)?;

    let timeout = config.device.connect_timeout;
    let local = match transport.connect(timeout).await {
        Ok(local) => local,
        Err(e) => {
            error!(error = %e, "Failed to connect to device");
            enter_error(state);
            return Err(e);
        }
    };
    info!(node = %local, "Connected to device");

    match verify_connected(transport, provisioner, config, state).await {
        Ok(()) => Ok(local),
        Err(e) => {
            error!(error = %e, "Device setup failed, closing link");
            transport.disconnect();
            enter_error(state);
            Err(e)
        }
    }
}

async fn verify_connected(
    transport: &Arc<dyn Transport>,
    provisioner: Option<&dyn Provisioner>,
    config: &Config,
    state: &StateMachine,
) -> Result<()> {
    state.transition(ControllerState::VerifyingKey)?;
    verify_and_provision(transport, provisioner, config).await?;
    state.transition(ControllerState::Ready)
}

/// Records a failed setup unless the state already moved on
fn enter_error(state: &StateMachine) {
    if let Err(e) = state.transition(ControllerState::Error) {
        warn!(error = %e, state = %state.current(), "Setup failure not recorded as error");
    }
}

async fn verify_and_provision(
    transport: &Arc<dyn Transport>,
    provisioner: Option<&dyn Provisioner>,
    config: &Config,
) -> Result<()> {
    let expected = config.security.decoded_key()?;
    let key = match expected.as_deref() {
        Some(key) => key,
        None => {
            debug!("No identity key configured, skipping verification");
            return Ok(());
        }
    };

    match verify_identity(transport.as_ref(), Some(key)) {
        Ok(()) => {
            info!("Device identity key verified");
            return Ok(());
        }
        Err(Error::IdentityMismatch(reason)) => {
            warn!(reason = %reason, "Device identity key mismatch");
        }
        Err(e) => return Err(e),
    }

    let provisioner = provisioner
        .ok_or_else(|| Error::identity_mismatch("key mismatch and no provisioner configured"))?;
    provisioner.provision(key).await?;

    // The device applies a new key only after the link is reopened
    transport.disconnect();
    transport.connect(config.device.connect_timeout).await?;

    verify_identity(transport.as_ref(), Some(key))?;
    info!("Device identity key provisioned and verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryTransport;

    fn config_with_key(key: &str) -> Config {
        Config::builder()
            .private_key(key)
            .connect_timeout(Duration::from_secs(1))
            .build()
    }

    fn local() -> PeerId {
        PeerId::new("!0000cafe").unwrap()
    }

    #[tokio::test]
    async fn test_no_key_configured_reaches_ready() {
        let memory = MemoryTransport::new(local());
        let transport: Arc<dyn Transport> = memory.clone();
        let state = StateMachine::new(4);

        let id = establish(&transport, None, &Config::default(), &state).await.unwrap();
        assert_eq!(id, local());
        assert_eq!(state.current(), ControllerState::Ready);
    }

    #[tokio::test]
    async fn test_matching_key() {
        let memory = MemoryTransport::new(local());
        memory.set_device_key(Some(vec![1, 2, 3, 4]));
        let transport: Arc<dyn Transport> = memory.clone();
        let state = StateMachine::new(4);

        establish(&transport, None, &config_with_key("AQIDBA=="), &state).await.unwrap();
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn test_mismatch_is_provisioned_once() {
        let memory = MemoryTransport::new(local());
        memory.set_device_key(Some(vec![9]));
        let provisioner = memory.provisioner();
        let transport: Arc<dyn Transport> = memory.clone();
        let state = StateMachine::new(4);

        establish(&transport, Some(&provisioner as &dyn Provisioner), &config_with_key("AQIDBA=="), &state)
            .await
            .unwrap();
        assert!(state.is_ready());
        assert_eq!(provisioner.calls(), 1);
        assert_eq!(memory.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_mismatch_ends_in_error() {
        let memory = MemoryTransport::new(local());
        memory.set_device_key(Some(vec![9]));
        let provisioner = memory.provisioner().ignoring();
        let transport: Arc<dyn Transport> = memory.clone();
        let state = StateMachine::new(4);

        let err = establish(&transport, Some(&provisioner as &dyn Provisioner), &config_with_key("AQIDBA=="), &state)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch(_)));
        assert_eq!(state.current(), ControllerState::Error);
        assert_eq!(provisioner.calls(), 1);
        assert!(!memory.is_connected());
    }

    #[tokio::test]
    async fn test_mismatch_without_provisioner() {
        let memory = MemoryTransport::new(local());
        let transport: Arc<dyn Transport> = memory.clone();
        let state = StateMachine::new(4);

        assert!(establish(&transport, None, &config_with_key("AQIDBA=="), &state).await.is_err());
        assert_eq!(state.current(), ControllerState::Error);
    }

    #[tokio::test]
    async fn test_connect_failure_ends_in_error() {
        let memory = MemoryTransport::new(local());
        memory.refuse_connects(1);
        let transport: Arc<dyn Transport> = memory.clone();
        let state = StateMachine::new(4);

        let err = establish(&transport, None, &Config::default(), &state).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(state.current(), ControllerState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_during_connect_closes_link() {
        let memory = MemoryTransport::new(local());
        memory.set_connect_delay(Duration::from_secs(5));
        let transport: Arc<dyn Transport> = memory.clone();
        let state = Arc::new(StateMachine::new(4));

        let task_state = state.clone();
        let setup = tokio::spawn(async move {
            let config = Config::builder().connect_timeout(Duration::from_secs(30)).build();
            establish(&transport, None, &config, &task_state).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state.current(), ControllerState::Connecting);
        state.transition(ControllerState::Disconnected).unwrap();

        let err = setup.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(state.current(), ControllerState::Disconnected);
        assert!(!memory.is_connected());
        assert_eq!(memory.connect_attempts(), 1);
    }

    #[test]
    fn test_command_template() {
        let provisioner = CommandProvisioner::new(
            vec!["meshtastic".into(), "--set".into(), "security.private_key".into(), "base64:{key}".into()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(provisioner.render(&[1, 2, 3, 4])[3], "base64:AQIDBA==");
        assert!(CommandProvisioner::new(Vec::new(), Duration::from_secs(5)).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_status() {
        let ok = CommandProvisioner::new(vec!["true".into()], Duration::from_secs(5)).unwrap();
        assert!(ok.provision(&[1]).await.is_ok());

        let failing = CommandProvisioner::new(vec!["false".into()], Duration::from_secs(5)).unwrap();
        assert!(matches!(failing.provision(&[1]).await, Err(Error::IdentityMismatch(_))));
    }
}
