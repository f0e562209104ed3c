//! Test doubles: a simulated board console, a power controller wired to it, a
//! scripted host shell and a fake downloader.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use regex::Regex;

use crate::board::{Board, ConsoleDescriptor, DeviceFamily, MasterImage, PowerEndpoint};
use crate::console::{Incoming, Transport};
use crate::error::{Error, Result};
use crate::power::{BootDevice, PowerController};
use crate::settings::Timeouts;
use crate::utils::{Downloader, Shell, ShellOutput};

/// A hostname no other test uses, so that the one-session-per-board registry
/// does not get in the way of tests running in parallel.
pub(crate) fn unique_host(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("{}-{}", prefix, COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub(crate) fn fast_timeouts() -> Timeouts {
    Timeouts {
        command: Duration::from_millis(500),
        status_probe: Duration::from_millis(200),
        boot: Duration::from_millis(500),
        prompt: Duration::from_millis(500),
        format: Duration::from_millis(500),
        transfer: Duration::from_millis(500),
        network: Duration::from_millis(500),
    }
}

pub(crate) fn test_board(family: DeviceFamily) -> Board {
    Board {
        hostname: unique_host("board"),
        family,
        console: ConsoleDescriptor::Command {
            command: "true".into(),
        },
        power: PowerEndpoint::Commands {
            on: "true".into(),
            off: "true".into(),
            reset: "true".into(),
            boot_disk: None,
            boot_network: None,
        },
        boot_part: 1,
        root_part: 2,
        lmc_dev: None,
        master: MasterImage::default(),
    }
}

// SimBoard ====================================================================

struct Rule {
    pattern: Regex,
    reply: String,
    status: i32,
    /// Never returns to the prompt on its own.
    hang: bool,
}

struct SimState {
    output: VecDeque<u8>,
    partial: Vec<u8>,
    prompt: String,
    last_status: i32,
    rules: Vec<Rule>,
    commands: Vec<String>,
    power_events: Vec<String>,
    boot_device: Option<BootDevice>,
    boot_banner: Option<String>,
    answer_probe: bool,
    closed: bool,
}

/// A board shell simulated well enough for the console code: it echoes what
/// it receives, prints its prompt after each command, answers the exit status
/// probe and replies to configured commands.
#[derive(Clone)]
pub(crate) struct SimBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimBoard {
    pub fn new() -> Self {
        SimBoard {
            state: Arc::new(Mutex::new(SimState {
                output: VecDeque::new(),
                partial: Vec::new(),
                prompt: String::new(),
                last_status: 0,
                rules: Vec::new(),
                commands: Vec::new(),
                power_events: Vec::new(),
                boot_device: None,
                boot_banner: Some(
                    "Loading, please wait...\r\nBusyBox v1.18.5 built-in shell (ash)\r\n".into(),
                ),
                answer_probe: true,
                closed: false,
            })),
        }
    }

    /// A board whose master image brings its network up and reaches the
    /// server.
    pub fn master_image() -> Self {
        let sim = SimBoard::new();
        sim.on(
            "configure_networking",
            "IP-Config: eth0 complete:\r\n address: 192.168.1.50    broadcast: 192.168.1.255",
            0,
        );
        sim.on(
            "^ipconfig eth0",
            "IP-Config: eth0 guessed broadcast address 192.168.1.255\r\n dns0     : 192.168.1.1      dns1   : 0.0.0.0",
            0,
        );
        sim.on("ping", "1 packets transmitted, 1 packets received", 0);
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(SimTransport { sim: self.clone() })
    }

    pub fn power(&self) -> Box<dyn PowerController> {
        Box::new(SimPower { sim: self.clone() })
    }

    /// Reply `reply` and exit with `status` to commands matching `pattern`.
    /// Rules added later take precedence.
    pub fn on(&self, pattern: &str, reply: &str, status: i32) {
        let rule = Rule {
            pattern: Regex::new(pattern).unwrap(),
            reply: reply.to_owned(),
            status,
            hang: false,
        };
        self.lock().rules.insert(0, rule);
    }

    /// Commands matching `pattern` run until interrupted with `Ctrl+C`.
    pub fn hang_on(&self, pattern: &str) {
        let rule = Rule {
            pattern: Regex::new(pattern).unwrap(),
            reply: String::new(),
            status: 0,
            hang: true,
        };
        self.lock().rules.insert(0, rule);
    }

    pub fn emit(&self, text: &str) {
        self.lock().output.extend(text.as_bytes());
    }

    pub fn set_prompt(&self, prompt: &str) {
        self.lock().prompt = prompt.to_owned();
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn silence_status_probe(&self) {
        self.lock().answer_probe = false;
    }

    /// Reset the board without it ever reaching the recovery environment.
    pub fn never_boot(&self) {
        self.lock().boot_banner = None;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn power_events(&self) -> Vec<String> {
        self.lock().power_events.clone()
    }
}

impl SimState {
    fn receive(&mut self, data: &[u8]) {
        for &byte in data {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.partial).into_owned();
                    self.partial.clear();
                    self.execute(&line);
                }
                3 => {
                    self.partial.clear();
                    self.commands.push("^C".into());
                    self.last_status = 130;
                    let prompt = self.prompt.clone();
                    self.output.extend(format!("^C\r\n{}", prompt).as_bytes());
                }
                other => self.partial.push(other),
            }
        }
    }

    fn execute(&mut self, line: &str) {
        self.commands.push(line.to_owned());
        self.output.extend(format!("{}\r\n", line).as_bytes());

        if let Some(value) = line.strip_prefix("export PS1=") {
            self.prompt = value.replace('\'', "").replace('"', "");
            self.last_status = 0;
        } else if line == "echo x$?x" {
            if self.answer_probe {
                let status = self.last_status;
                self.output.extend(format!("x{}x\r\n", status).as_bytes());
            }
        } else {
            let rule = self.rules.iter().find(|r| r.pattern.is_match(line));
            if rule.map_or(false, |r| r.hang) {
                return;
            }
            let (reply, status) = match rule {
                Some(rule) => (rule.reply.clone(), rule.status),
                None => (String::new(), 0),
            };
            if !reply.is_empty() {
                self.output.extend(format!("{}\r\n", reply).as_bytes());
            }
            self.last_status = status;
        }

        let prompt = self.prompt.clone();
        self.output.extend(prompt.as_bytes());
    }
}

struct SimTransport {
    sim: SimBoard,
}

impl Transport for SimTransport {
    fn receive(&mut self, timeout: Duration) -> io::Result<Incoming> {
        {
            let mut state = self.sim.lock();
            if !state.output.is_empty() {
                return Ok(Incoming::Data(state.output.drain(..).collect()));
            }
            if state.closed {
                return Ok(Incoming::Closed);
            }
        }
        thread::sleep(std::cmp::min(timeout, Duration::from_millis(5)));
        Ok(Incoming::Idle)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.sim.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        state.receive(data);
        Ok(())
    }
}

struct SimPower {
    sim: SimBoard,
}

impl PowerController for SimPower {
    fn power_on(&mut self) -> Result<()> {
        self.sim.lock().power_events.push("on".into());
        Ok(())
    }

    fn power_off(&mut self) -> Result<()> {
        self.sim.lock().power_events.push("off".into());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut state = self.sim.lock();
        state.power_events.push("reset".into());
        if state.boot_device == Some(BootDevice::Network) {
            if let Some(banner) = state.boot_banner.clone() {
                state.prompt = "(initramfs) ".into();
                state.output.extend(format!("{}(initramfs) ", banner).as_bytes());
            }
        }
        Ok(())
    }

    fn set_boot_device(&mut self, device: BootDevice) -> Result<()> {
        let mut state = self.sim.lock();
        state.power_events.push(format!("bootdev {:?}", device));
        state.boot_device = Some(device);
        Ok(())
    }
}

// FakeShell ===================================================================

type Behaviour = Box<dyn Fn(&[String]) -> ShellOutput + Send + Sync>;

/// A host shell answering commands from a list of scripted behaviours.
pub(crate) struct FakeShell {
    rules: Mutex<Vec<(Regex, Behaviour)>>,
    calls: Mutex<Vec<Vec<String>>>,
}

const PARTED_OUTPUT: &str = "BYT;\n\
    /tmp/lava.img:3221225472B:file:512:512:msdos::;\n\
    1:4194304B:56623103B:52428800B:fat32::boot, lba;\n\
    2:56623104B:3221225471B:3164602368B:ext4::;\n";

impl FakeShell {
    /// A shell where every command succeeds and the image tools produce the
    /// files they are expected to produce.
    pub fn host() -> Self {
        let shell = FakeShell {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        };
        shell.on("", |_| ok(""));
        shell.on(r"linaro-media-create -v$", |_| ok("linaro-media-create 2012.06"));
        shell.on("--image-file", |argv| {
            touch(arg_after(argv, "--image-file"));
            ok("")
        });
        shell.on(r"\bparted\b", |_| ok(PARTED_OUTPUT));
        shell.on(r"\btar\b.*-czf", |argv| {
            touch(arg_after(argv, "-czf"));
            ok("")
        });
        shell.on(r"linaro-hwpack-replace -t .* -p ", |argv| {
            if let Some(hwpack) = arg_after(argv, "-t") {
                let dir = Path::new(hwpack).parent().unwrap_or_else(|| Path::new("."));
                fs::write(dir.join("hwpack_new-kernel_20120601.tar.gz"), b"hwpack").unwrap();
            }
            ok("")
        });
        shell
    }

    /// Answer commands matching `pattern` with `behaviour`. Behaviours added
    /// later take precedence.
    pub fn on<F>(&self, pattern: &str, behaviour: F)
    where
        F: Fn(&[String]) -> ShellOutput + Send + Sync + 'static,
    {
        let pattern = Regex::new(pattern).unwrap();
        self.rules
            .lock()
            .unwrap()
            .insert(0, (pattern, Box::new(behaviour)));
    }

    /// Fail commands matching `pattern`.
    pub fn fail(&self, pattern: &str, status: i32, output: &str) {
        let output = output.to_owned();
        self.on(pattern, move |_| ShellOutput {
            status,
            output: output.clone(),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect()
    }
}

impl Shell for FakeShell {
    fn exec(&self, argv: &[String]) -> io::Result<ShellOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        let line = argv.join(" ");
        let rules = self.rules.lock().unwrap();
        let behaviour = rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(&line))
            .map(|(_, behaviour)| behaviour);
        Ok(match behaviour {
            Some(behaviour) => behaviour(argv),
            None => ok(""),
        })
    }
}

fn ok(output: &str) -> ShellOutput {
    ShellOutput {
        status: 0,
        output: output.to_owned(),
    }
}

fn arg_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

fn touch(path: Option<&str>) {
    if let Some(path) = path {
        fs::write(path, b"data").unwrap();
    }
}

// FakeDownloader ==============================================================

/// A downloader writing the requested URL into the destination file.
#[derive(Default)]
pub(crate) struct FakeDownloader {
    requests: Mutex<Vec<(String, bool)>>,
    failing: Mutex<Vec<String>>,
    served: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail downloads of URLs containing `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_owned());
    }

    /// Answer downloads of URLs containing `needle` with `content`.
    pub fn serve(&self, needle: &str, content: Vec<u8>) {
        self.served.lock().unwrap().push((needle.to_owned(), content));
    }

    /// Requested URLs, with whether the cache was asked for.
    pub fn requests(&self) -> Vec<(String, bool)> {
        self.requests.lock().unwrap().clone()
    }

    fn fetch(&self, url: &str, dest_dir: &Path, cached: bool) -> Result<PathBuf> {
        self.requests.lock().unwrap().push((url.to_owned(), cached));
        if self.failing.lock().unwrap().iter().any(|n| url.contains(n)) {
            return Err(Error::Download {
                url: url.to_owned(),
                reason: "connection refused".into(),
            });
        }
        let name = url.rsplit('/').next().unwrap_or("download");
        let path = dest_dir.join(name);
        let served = self.served.lock().unwrap();
        let content = served
            .iter()
            .find(|(needle, _)| url.contains(needle))
            .map_or(url.as_bytes(), |(_, content)| content.as_slice());
        fs::write(&path, content)?;
        Ok(path)
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.fetch(url, dest_dir, false)
    }

    fn download_with_cache(&self, url: &str, dest_dir: &Path, _cache_dir: &Path) -> Result<PathBuf> {
        self.fetch(url, dest_dir, true)
    }
}
