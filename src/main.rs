// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#[macro_use]
extern crate log;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};

use clap::Parser;
use env_logger::{Builder, Env, Target};

use vdisk_blkback::daemon::{self, Config, IoErrorPolicy};
use vdisk_blkback::query::{self, Query};
use vdisk_blkback::RawImage;

/// Serves a disk image to a paravirtualized block front end.
#[derive(Parser, Debug)]
#[command(name = "vdisk", version)]
struct Args {
    /// Path of the disk image.
    #[arg(short = 'f', long)]
    image: PathBuf,

    /// Tap device node to serve the front end through.
    #[arg(
        short = 'x',
        long,
        required_unless_present = "query",
        conflicts_with = "query"
    )]
    channel: Option<PathBuf>,

    /// Answer a question about the image and exit. Known queries: "sectors".
    #[arg(short = 'q', long)]
    query: Option<Query>,

    /// File to write the daemon's pid to.
    #[arg(short = 'p', long)]
    pid_file: Option<PathBuf>,

    /// Stay attached to the terminal and log to stderr.
    #[arg(long)]
    foreground: bool,

    /// Directory for the per-process log file of a detached daemon.
    #[arg(long, default_value = "/var/log/xen")]
    log_dir: PathBuf,

    /// What to do after a request fails.
    #[arg(long, value_enum, default_value_t = IoErrorPolicy::Halt)]
    on_io_error: IoErrorPolicy,
}

fn init_logger(file: Option<File>) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Some(file) = file {
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.init();
}

const READY: u8 = 1;

// Lets the parent of a detached daemon exit with the outcome of setup.
struct Readiness {
    pipe: File,
}

impl Readiness {
    // Consumes the notice. Dropping it unsent makes the parent fail.
    fn report(mut self) {
        if let Err(e) = self.pipe.write_all(&[READY]) {
            warn!("unable to report readiness: {}", e);
        }
    }
}

fn readiness_pipe() -> io::Result<(File, Readiness)> {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) returns.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are fresh and owned by nothing else.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok((read, Readiness { pipe: write }))
}

// Blocks until the child reports readiness or goes away, and returns the exit status for it.
fn await_readiness(mut pipe: File) -> i32 {
    let mut status = [0u8; 1];
    match pipe.read(&mut status) {
        Ok(1) if status[0] == READY => 0,
        _ => 1,
    }
}

// Detaches from the terminal and opens the log file of the detached process. The parent stays
// around until the returned notice is reported or dropped.
fn daemonize(log_dir: &Path) -> io::Result<(File, Readiness)> {
    let (parent_end, readiness) = readiness_pipe()?;

    // SAFETY: nothing else runs yet.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => drop(parent_end),
        _ => {
            drop(readiness);
            let code = await_readiness(parent_end);
            // SAFETY: _exit(2) skips the destructors the child still owns resources through.
            unsafe { libc::_exit(code) }
        }
    }

    // SAFETY: setsid(2) takes no arguments; the child is never a group leader.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("vdisk.{}.log", process::id())))?;

    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open; dup2(2) only replaces `fd`.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok((log, readiness))
}

fn run_query(image: &Path, query: Query) -> ExitCode {
    init_logger(None);

    let answer = RawImage::open(image, true).and_then(|mut disk| query::answer(query, &mut disk));
    match answer {
        Ok(answer) => {
            println!("{}", answer);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("unable to query vdisk \"{}\": {}", image.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn run_daemon(args: Args, channel: PathBuf) -> ExitCode {
    let readiness = if args.foreground {
        init_logger(None);
        None
    } else {
        match daemonize(&args.log_dir) {
            Ok((log, readiness)) => {
                init_logger(Some(log));
                Some(readiness)
            }
            Err(e) => {
                eprintln!("vdisk: unable to detach: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    if let Some(path) = &args.pid_file {
        if let Err(e) = fs::write(path, format!("{}\n", process::id())) {
            error!("unable to write pid file \"{}\": {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    }

    let config = Config {
        image: args.image,
        channel,
        io_error_policy: args.on_io_error,
    };
    info!(
        "serving \"{}\" through \"{}\"",
        config.image.display(),
        config.channel.display()
    );

    let daemon = match daemon::setup(&config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(readiness) = readiness {
        // Relative paths were resolved by setup.
        if let Err(e) = std::env::set_current_dir("/") {
            warn!("unable to change directory to /: {}", e);
        }
        readiness.report();
    }

    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let mut args = Args::parse();

    if let Some(query) = args.query {
        return run_query(&args.image, query);
    }
    match args.channel.take() {
        Some(channel) => run_daemon(args, channel),
        // Unreachable: clap requires one of the two.
        None => ExitCode::FAILURE,
    }
}
