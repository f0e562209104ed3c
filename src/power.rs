//! Out-of-band power and boot device control.
//!
//! Every operation is idempotent and can be invoked whatever state the board
//! is in: power-cycling a board that is already off, or selecting the boot
//! device it already uses, is fine.

use std::sync::Arc;

use log::{debug, info};

use crate::board::PowerEndpoint;
use crate::error::Result;
use crate::utils::{run_checked, Shell};

/// Where the board boots from on its next reset.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BootDevice {
    Disk,
    /// Network boot into the master image.
    Network,
}

pub trait PowerController: Send {
    fn power_on(&mut self) -> Result<()>;
    fn power_off(&mut self) -> Result<()>;
    fn reset(&mut self) -> Result<()>;
    fn set_boot_device(&mut self, device: BootDevice) -> Result<()>;
}

/// Build the controller described by a board power endpoint.
pub fn controller(endpoint: &PowerEndpoint, shell: Arc<dyn Shell>) -> Box<dyn PowerController> {
    match endpoint {
        PowerEndpoint::Ipmi {
            host,
            user,
            password,
        } => Box::new(IpmiTool::new(host, user, password, shell)),
        PowerEndpoint::Commands {
            on,
            off,
            reset,
            boot_disk,
            boot_network,
        } => Box::new(CommandPower {
            on: on.clone(),
            off: off.clone(),
            reset: reset.clone(),
            boot_disk: boot_disk.clone(),
            boot_network: boot_network.clone(),
            shell,
        }),
    }
}

/// Have the board boot from its test partitions: select the disk, make sure
/// it is on, then reset it.
pub fn boot_from_disk(power: &mut dyn PowerController) -> Result<()> {
    power.set_boot_device(BootDevice::Disk)?;
    power.power_on()?;
    power.reset()
}

// IpmiTool ====================================================================

/// Drives the board management controller with `ipmitool`.
pub struct IpmiTool {
    host: String,
    user: String,
    password: String,
    shell: Arc<dyn Shell>,
}

impl IpmiTool {
    pub fn new(host: &str, user: &str, password: &str, shell: Arc<dyn Shell>) -> Self {
        IpmiTool {
            host: host.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            shell,
        }
    }

    fn chassis(&self, args: &[&str]) -> Result<()> {
        let mut argv: Vec<String> = vec![
            "ipmitool".into(),
            "-H".into(),
            self.host.clone(),
            "-U".into(),
            self.user.clone(),
            "-P".into(),
            self.password.clone(),
            "chassis".into(),
        ];
        argv.extend(args.iter().map(|a| (*a).to_owned()));
        debug!("ipmitool {} chassis {}", self.host, args.join(" "));
        run_checked(self.shell.as_ref(), &argv, "ipmitool")
            .map(|_| ())
            .map_err(|e| e.into_critical(format!("power control of {} failed", self.host)))
    }
}

impl PowerController for IpmiTool {
    fn power_on(&mut self) -> Result<()> {
        info!("Powering on {}", self.host);
        self.chassis(&["power", "on"])
    }

    fn power_off(&mut self) -> Result<()> {
        info!("Powering off {}", self.host);
        self.chassis(&["power", "off"])
    }

    fn reset(&mut self) -> Result<()> {
        info!("Resetting {}", self.host);
        self.chassis(&["power", "reset"])
    }

    fn set_boot_device(&mut self, device: BootDevice) -> Result<()> {
        match device {
            BootDevice::Disk => self.chassis(&["bootdev", "disk"]),
            BootDevice::Network => self.chassis(&["bootdev", "pxe"]),
        }
    }
}

// CommandPower ================================================================

/// Power control through host commands, typically PDU scripts. Boards without
/// boot device selection leave the `boot_*` commands unset.
pub struct CommandPower {
    on: String,
    off: String,
    reset: String,
    boot_disk: Option<String>,
    boot_network: Option<String>,
    shell: Arc<dyn Shell>,
}

impl CommandPower {
    fn run(&self, command: &str) -> Result<()> {
        let argv = vec!["sh".to_owned(), "-c".to_owned(), command.to_owned()];
        run_checked(self.shell.as_ref(), &argv, command)
            .map(|_| ())
            .map_err(|e| e.into_critical("power control failed"))
    }
}

impl PowerController for CommandPower {
    fn power_on(&mut self) -> Result<()> {
        self.run(&self.on)
    }

    fn power_off(&mut self) -> Result<()> {
        self.run(&self.off)
    }

    fn reset(&mut self) -> Result<()> {
        self.run(&self.reset)
    }

    fn set_boot_device(&mut self, device: BootDevice) -> Result<()> {
        let command = match device {
            BootDevice::Disk => &self.boot_disk,
            BootDevice::Network => &self.boot_network,
        };
        match command {
            Some(command) => self.run(command),
            None => {
                debug!("no command to select boot device {:?}, skipped", device);
                Ok(())
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
