//! The handle driving one board: its console session, its power controller,
//! and the host tools used to prepare what gets deployed on it.

use std::sync::Arc;

use log::{debug, error, info};

use crate::acquisition::ImageAcquisition;
use crate::board::Board;
use crate::console::{CommandRunner, ConsoleSession, NetworkCommandRunner};
use crate::error::{Error, Result};
use crate::master_boot::{self, MasterEnv};
use crate::power::{self, PowerController};
use crate::settings::Settings;
use crate::utils::{Downloader, HttpDownloader, Shell, SystemShell};

pub struct Target {
    board: Board,
    settings: Settings,
    session: Option<ConsoleSession>,
    power: Box<dyn PowerController>,
    shell: Arc<dyn Shell>,
    downloader: Arc<dyn Downloader>,
}

impl Target {
    /// Connect to the console of `board` and set up its power controller and
    /// the host tools.
    pub fn connect(board: Board, settings: Settings) -> Result<Self> {
        info!("Connecting to {}", board.hostname);
        let session = ConsoleSession::connect(&board)?;
        let shell: Arc<dyn Shell> = Arc::new(SystemShell);
        let power = power::controller(&board.power, shell.clone());
        let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new()?);
        Ok(Target::new(board, settings, session, power, shell, downloader))
    }

    pub fn new(
        board: Board,
        settings: Settings,
        session: ConsoleSession,
        power: Box<dyn PowerController>,
        shell: Arc<dyn Shell>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Target {
            board,
            settings,
            session: Some(session),
            power,
            shell,
            downloader,
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn shell(&self) -> Arc<dyn Shell> {
        self.shell.clone()
    }

    pub fn acquisition(&self) -> ImageAcquisition {
        ImageAcquisition::new(self.downloader.clone(), &self.settings.cache_dir)
    }

    pub fn power(&mut self) -> &mut dyn PowerController {
        self.power.as_mut()
    }

    /// The console transcript so far.
    pub fn transcript(&self) -> &str {
        self.session.as_ref().map_or("", |s| s.transcript())
    }

    /// Boot the board into its master image and hand a runner sitting at the
    /// master prompt to `f`.
    ///
    /// Whatever the outcome, the board is left booted in the master image and
    /// the session is kept for the next caller. On failure the console
    /// transcript is logged before the error is returned.
    pub fn with_master<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut NetworkCommandRunner<'_>, &MasterEnv) -> Result<T>,
    {
        let session = self
            .session
            .take()
            .ok_or_else(|| Error::critical(format!("lost the console of {}", self.board.hostname)))?;

        info!("Booting {} into the master image", self.board.hostname);
        let timeouts = self.settings.timeouts;
        let (mut session, booted) =
            master_boot::factory(session, self.power.as_mut(), &self.board.master, timeouts).run();

        let result = booted.and_then(|env| {
            let runner = CommandRunner::new(&mut session, &self.board.master.prompt, timeouts);
            let mut runner = NetworkCommandRunner::new(runner);
            f(&mut runner, &env)
        });

        if let Err(e) = &result {
            error!("{}: {}", self.board.hostname, e);
            error!("Console transcript:\n{}", session.transcript());
        }
        debug!("{}: done with the master image", self.board.hostname);
        self.session = Some(session);
        result
    }

    /// Hand the board back to the system under test: boot from the test
    /// partitions from now on, then power cycle.
    pub fn boot_test_image(&mut self) -> Result<()> {
        info!("Booting {} from its test partitions", self.board.hostname);
        power::boot_from_disk(self.power.as_mut())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::DeviceFamily;
    use crate::console::RunOptions;
    use crate::settings::SettingsBuilder;
    use crate::testing::{fast_timeouts, test_board, FakeDownloader, FakeShell, SimBoard};

    fn target(sim: &SimBoard) -> Target {
        let board = test_board(DeviceFamily::Generic);
        let session = ConsoleSession::open(&board.hostname, sim.transport()).unwrap();
        let settings = SettingsBuilder::new().timeouts(fast_timeouts()).finalize();
        Target::new(
            board,
            settings,
            session,
            sim.power(),
            Arc::new(FakeShell::host()),
            Arc::new(FakeDownloader::new()),
        )
    }

    #[test]
    fn runner_sits_at_the_master_prompt() {
        let sim = SimBoard::master_image();
        sim.on("^uname", "Linux master 3.5.0", 0);
        let mut target = target(&sim);
        let output = target
            .with_master(|runner, env| {
                assert_eq!(env.ip, "192.168.1.50");
                Ok(runner.run("uname -a", RunOptions::new())?.output)
            })
            .unwrap();
        assert!(output.contains("Linux master"));
    }

    #[test]
    fn session_survives_a_failed_scope() {
        let sim = SimBoard::master_image();
        sim.on("^false", "", 1);
        let mut target = target(&sim);
        let err = target
            .with_master(|runner, _| runner.run("false", RunOptions::new()).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));

        // The board can be driven again.
        assert!(target.with_master(|_, _| Ok(())).is_ok());
        assert_eq!(
            sim.power_events(),
            vec!["bootdev Network", "reset", "bootdev Network", "reset"]
        );
    }

    #[test]
    fn test_image_boots_from_disk() {
        let sim = SimBoard::master_image();
        let mut target = target(&sim);
        target.with_master(|_, _| Ok(())).unwrap();
        target.boot_test_image().unwrap();
        assert_eq!(
            sim.power_events(),
            vec!["bootdev Network", "reset", "bootdev Disk", "on", "reset"]
        );
    }

    #[test]
    fn boot_failure_never_reaches_the_scope() {
        let sim = SimBoard::master_image();
        sim.never_boot();
        let mut target = target(&sim);
        let mut called = false;
        let err = target
            .with_master(|_, _| {
                called = true;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_critical());
        assert!(!called);
    }
}
