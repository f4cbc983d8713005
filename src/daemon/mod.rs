// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The request serving loop.
//!
//! One request is handled completely, from its disk image calls to its published response,
//! before the next one is looked at. That alone keeps responses in request order. The daemon
//! moves through `Initializing -> Running -> Draining -> Terminated` once; the only way back out
//! of `Running` is the loop deciding to stop, whether because of an error or because a
//! termination signal raised the shutdown flag.

pub mod signal;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use vmm_sys_util::errno;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::block::{self, coalesce, DiskBackend, RawImage};
use crate::device::{self, Notifier, XpvtapDevice};
use crate::ring::{self, BackRing, GrantBuffer, Operation, Request, Status};

/// What to do with the session after a request fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IoErrorPolicy {
    /// Answer the failed request, then stop serving.
    #[default]
    Halt,
    /// Answer the failed request and keep serving.
    Continue,
}

/// Daemon configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the disk image.
    pub image: PathBuf,
    /// Path of the tap device node.
    pub channel: PathBuf,
    /// Reaction to failed requests.
    pub io_error_policy: IoErrorPolicy,
}

/// Daemon errors.
///
/// Everything but `BackendIo` and `InvalidRequest` ends the session without answering the
/// request at hand; those two are answered with an error status first.
#[derive(Debug)]
pub enum Error {
    /// Opening the disk image failed.
    OpenImage(block::Error),
    /// Opening or mapping the tap device failed.
    Device(device::Error),
    /// Creating the wakeup event failed.
    Wakeup(io::Error),
    /// Installing the termination signal handlers failed.
    Signal(errno::Error),
    /// The front end used an operation code we don't know.
    UnknownOperation {
        /// Correlation token of the offending request.
        id: u64,
        /// The unknown code.
        operation: u8,
    },
    /// The shared ring can't be used any more.
    Ring(ring::Error),
    /// A request was malformed or reached outside its grant pages.
    InvalidRequest(ring::Error),
    /// A disk image call failed.
    BackendIo(block::Error),
    /// The front end could not be told about published responses.
    Notification(io::Error),
    /// Waiting for the front end failed.
    Wait(io::Error),
    /// Closing the disk image failed.
    Close(block::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            OpenImage(e) => write!(f, "unable to open vdisk: {}", e),
            Device(e) => write!(f, "{}", e),
            Wakeup(e) => write!(f, "unable to create wakeup event: {}", e),
            Signal(e) => write!(f, "unable to install signal handlers: {}", e),
            UnknownOperation { id, operation } => write!(
                f,
                "protocol violation: unknown operation {} in request {:#x}",
                operation, id
            ),
            Ring(e) => write!(f, "ring failure: {}", e),
            InvalidRequest(e) => write!(f, "{}", e),
            BackendIo(e) => write!(f, "{}", e),
            Notification(e) => write!(f, "unable to notify front end: {}", e),
            Wait(e) => write!(f, "unable to wait for requests: {}", e),
            Close(e) => write!(f, "unable to close vdisk: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Result of daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle stages of a daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Resources are being acquired.
    Initializing,
    /// Requests are being served.
    Running,
    /// The disk image is being released.
    Draining,
    /// Nothing is left to do.
    Terminated,
}

/// Serves one disk image to one front end.
pub struct Daemon<'a, B, N> {
    ring: BackRing,
    grants: GrantBuffer,
    backend: B,
    notifier: N,
    policy: IoErrorPolicy,
    shutdown: &'a AtomicBool,
    ever_wrote: bool,
    state: State,
}

/// Acquires everything a session needs: the disk image, the tap device mappings and the
/// termination signal handlers.
///
/// When anything after opening the image fails, the image is closed again without a flush.
pub fn setup(config: &Config) -> Result<Daemon<'static, RawImage, XpvtapDevice>> {
    let mut image = RawImage::open(&config.image, false).map_err(|e| {
        error!("unable to open vdisk \"{}\": {}", config.image.display(), e);
        Error::OpenImage(e)
    })?;

    match attach(config) {
        Ok((device, ring, grants, shutdown)) => Ok(Daemon::new(
            ring,
            grants,
            image,
            device,
            config.io_error_policy,
            shutdown,
        )),
        Err(e) => {
            error!("{}", e);
            image.set_skip_flush_on_close(true);
            if let Err(e) = image.close() {
                error!("unable to close vdisk: {}", e);
            }
            Err(e)
        }
    }
}

type Attached = (XpvtapDevice, BackRing, GrantBuffer, &'static AtomicBool);

fn attach(config: &Config) -> Result<Attached> {
    let mut device = XpvtapDevice::open(&config.channel).map_err(Error::Device)?;
    let ring = device.map_ring().map_err(Error::Device)?;
    let grants = device.map_grants().map_err(Error::Device)?;

    let wakeup = EventFd::new(EFD_NONBLOCK).map_err(Error::Wakeup)?;
    device.set_wakeup(wakeup).map_err(Error::Device)?;
    let shutdown = signal::install(device.wakeup_fd()).map_err(Error::Signal)?;

    Ok((device, ring, grants, shutdown))
}

impl<'a, B: DiskBackend, N: Notifier> Daemon<'a, B, N> {
    /// Assembles a daemon from its parts. `shutdown` is polled between requests.
    pub fn new(
        ring: BackRing,
        grants: GrantBuffer,
        backend: B,
        notifier: N,
        policy: IoErrorPolicy,
        shutdown: &'a AtomicBool,
    ) -> Self {
        Daemon {
            ring,
            grants,
            backend,
            notifier,
            policy,
            shutdown,
            ever_wrote: false,
            state: State::Initializing,
        }
    }

    /// Serves requests until told to stop, then releases the disk image.
    ///
    /// Returns `Ok` when the session ended because shutdown was requested, and the error that
    /// stopped it otherwise.
    pub fn run(mut self) -> Result<()> {
        self.enter(State::Running);
        info!("starting up");
        let served = self.serve();

        self.enter(State::Draining);
        info!("shutting down");
        let closed = self.drain();

        self.enter(State::Terminated);
        served.and(closed)
    }

    fn enter(&mut self, state: State) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            while !self.shutdown_requested() {
                match self.ring.take_next() {
                    Ok(Some(request)) => self.dispatch(request)?,
                    Ok(None) => break,
                    Err(e @ ring::Error::InvalidRequest { .. }) => self.reject(e)?,
                    Err(e) => {
                        error!("{}", e);
                        return Err(Error::Ring(e));
                    }
                }
            }

            if self.shutdown_requested() {
                info!("shutdown requested");
                return Ok(());
            }

            // Sleep until the front end tells us there are more requests.
            self.notifier.wait().map_err(|e| {
                error!("unable to wait for requests: {}", e);
                Error::Wait(e)
            })?;
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<()> {
        debug!(
            "{:?}: id={:#x} sector={:#x} segments={}",
            request.operation(),
            request.id(),
            request.sector(),
            request.segments().len()
        );

        let outcome = match request.operation() {
            Operation::Read => self.transfer(&request),
            Operation::Write => {
                self.ever_wrote = true;
                self.transfer(&request)
            }
            // Barriers count as writes for the close time flush decision, even though they
            // carry no data.
            Operation::WriteBarrier => {
                self.ever_wrote = true;
                self.flush(&request)
            }
            Operation::FlushDiskCache => self.flush(&request),
            Operation::Unknown(operation) => {
                error!(
                    "unknown operation {} in request {:#x}, stopping",
                    operation,
                    request.id()
                );
                return Err(Error::UnknownOperation {
                    id: request.id(),
                    operation,
                });
            }
        };

        let status = match outcome {
            Ok(()) => Status::Okay,
            Err(_) => Status::Error,
        };
        self.respond(request.id(), request.operation(), status)?;
        self.apply_policy(outcome)
    }

    fn transfer(&mut self, request: &Request) -> Result<()> {
        let write = request.operation() == Operation::Write;

        for call in coalesce(request.offset(), request.segments()) {
            trace!(
                "{:?}: off={:#x} seg={} first={} len={:#x}",
                request.operation(),
                call.offset,
                call.segment,
                call.first_subblock,
                call.len
            );

            let buf = self
                .grants
                .slice(request.slot(), call.segment, call.first_subblock, call.len)
                .map_err(|e| {
                    error!("request {:#x}: {}", request.id(), e);
                    Error::InvalidRequest(e)
                })?;

            let result = if write {
                self.backend.write(call.offset, buf)
            } else {
                self.backend.read(call.offset, buf)
            };
            result.map_err(|e| {
                error!(
                    "{:?} failed: id={:#x} sector={:#x} segments={} off={:#x}: {}",
                    request.operation(),
                    request.id(),
                    request.sector(),
                    request.segments().len(),
                    call.offset,
                    e
                );
                Error::BackendIo(e)
            })?;
        }

        Ok(())
    }

    fn flush(&mut self, request: &Request) -> Result<()> {
        self.backend.flush().map_err(|e| {
            error!(
                "{:?} failed: id={:#x}: {}",
                request.operation(),
                request.id(),
                e
            );
            Error::BackendIo(e)
        })
    }

    // Answers a request that failed validation.
    fn reject(&mut self, error: ring::Error) -> Result<()> {
        error!("{}", error);
        if let ring::Error::InvalidRequest { id, operation, .. } = &error {
            self.respond(*id, Operation::from(*operation), Status::Error)?;
        }
        self.apply_policy(Err(Error::InvalidRequest(error)))
    }

    fn respond(&mut self, id: u64, operation: Operation, status: Status) -> Result<()> {
        self.ring
            .push_response(id, operation, status)
            .map_err(|e| {
                error!("unable to write response: {}", e);
                Error::Ring(e)
            })?;

        // Without the notification the front end may never see what was just published.
        self.notifier.notify().map_err(|e| {
            error!("unable to send response for request {:#x}: {}", id, e);
            Error::Notification(e)
        })
    }

    fn apply_policy(&self, outcome: Result<()>) -> Result<()> {
        match (outcome, self.policy) {
            (Err(e), IoErrorPolicy::Halt) => Err(e),
            _ => Ok(()),
        }
    }

    fn drain(&mut self) -> Result<()> {
        debug!(
            "consumed {} requests, produced {} responses",
            self.ring.req_cons(),
            self.ring.rsp_prod()
        );

        // Disk images flush on close even when nothing was written. Spare them that.
        if !self.ever_wrote {
            self.backend.set_skip_flush_on_close(true);
        }
        self.backend.close().map_err(|e| {
            error!("unable to close vdisk: {}", e);
            Error::Close(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use std::io::Write;

    use vm_memory::VolatileSlice;
    use vmm_sys_util::tempfile::TempFile;

    use crate::ring::tests::FrontEnd;
    use crate::ring::RequestSlot;

    const READ: u8 = 0;
    const WRITE: u8 = 1;
    const BARRIER: u8 = 2;
    const FLUSH: u8 = 3;

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Read { offset: u64, len: usize },
        Write { offset: u64, len: usize },
        Flush,
        SkipFlush(bool),
        Close,
    }

    #[derive(Default)]
    struct DiskLog {
        calls: Vec<Call>,
        // Index into the data and flush calls that should fail.
        fail_on: Option<usize>,
        // Index of the call during which a termination signal arrives.
        shutdown_on: Option<usize>,
        io_count: usize,
        written: Vec<Vec<u8>>,
    }

    struct FakeDisk<'a> {
        log: Rc<RefCell<DiskLog>>,
        shutdown: &'a AtomicBool,
    }

    impl FakeDisk<'_> {
        fn io(&self, call: Call) -> block::Result<()> {
            let mut log = self.log.borrow_mut();
            log.calls.push(call);
            let index = log.io_count;
            log.io_count += 1;
            if log.shutdown_on == Some(index) {
                self.shutdown.store(true, Ordering::SeqCst);
            }
            if log.fail_on == Some(index) {
                return Err(block::Error::Flush(io::Error::from_raw_os_error(libc::EIO)));
            }
            Ok(())
        }
    }

    // Data read from disk: every byte holds the low bits of its sector number.
    fn disk_byte(offset: u64) -> u8 {
        (offset >> 9) as u8
    }

    impl DiskBackend for FakeDisk<'_> {
        fn read(&mut self, offset: u64, buf: VolatileSlice) -> block::Result<()> {
            self.io(Call::Read {
                offset,
                len: buf.len(),
            })?;
            let data: Vec<u8> = (0..buf.len() as u64)
                .map(|i| disk_byte(offset + i))
                .collect();
            buf.copy_from(&data);
            Ok(())
        }

        fn write(&mut self, offset: u64, buf: VolatileSlice) -> block::Result<()> {
            self.io(Call::Write {
                offset,
                len: buf.len(),
            })?;
            let mut data = vec![0u8; buf.len()];
            buf.copy_to(&mut data);
            self.log.borrow_mut().written.push(data);
            Ok(())
        }

        fn flush(&mut self) -> block::Result<()> {
            self.io(Call::Flush)
        }

        fn size(&self) -> block::Result<u64> {
            Ok(1 << 30)
        }

        fn set_skip_flush_on_close(&mut self, skip: bool) {
            self.log.borrow_mut().calls.push(Call::SkipFlush(skip));
        }

        fn close(&mut self) -> block::Result<()> {
            self.log.borrow_mut().calls.push(Call::Close);
            Ok(())
        }
    }

    #[derive(Default)]
    struct NotifyLog {
        notifications: usize,
        waits: usize,
        fail_notify: bool,
        // Requests the front end publishes the next time we wait.
        on_wait: Vec<RequestSlot>,
    }

    struct FakeNotifier<'a> {
        log: Rc<RefCell<NotifyLog>>,
        front: Rc<RefCell<FrontEnd>>,
        shutdown: &'a AtomicBool,
    }

    impl Notifier for FakeNotifier<'_> {
        fn notify(&self) -> io::Result<()> {
            let mut log = self.log.borrow_mut();
            if log.fail_notify {
                return Err(io::Error::from_raw_os_error(libc::ENXIO));
            }
            log.notifications += 1;
            Ok(())
        }

        fn wait(&self) -> io::Result<()> {
            let mut log = self.log.borrow_mut();
            log.waits += 1;
            if log.on_wait.is_empty() {
                // Nothing more is coming; behave as if a termination signal arrived.
                self.shutdown.store(true, Ordering::SeqCst);
            } else {
                let mut front = self.front.borrow_mut();
                for request in log.on_wait.drain(..) {
                    front.submit(request);
                }
            }
            Ok(())
        }
    }

    struct Session<'a> {
        front: Rc<RefCell<FrontEnd>>,
        disk: Rc<RefCell<DiskLog>>,
        notes: Rc<RefCell<NotifyLog>>,
        daemon: Daemon<'a, FakeDisk<'a>, FakeNotifier<'a>>,
    }

    impl<'a> Session<'a> {
        fn new(shutdown: &'a AtomicBool, policy: IoErrorPolicy) -> Self {
            let (front, ring, grants) = FrontEnd::new();
            let front = Rc::new(RefCell::new(front));
            let disk = Rc::new(RefCell::new(DiskLog::default()));
            let notes = Rc::new(RefCell::new(NotifyLog::default()));
            let notifier = FakeNotifier {
                log: notes.clone(),
                front: front.clone(),
                shutdown,
            };
            let daemon = Daemon::new(
                ring,
                grants,
                FakeDisk {
                    log: disk.clone(),
                    shutdown,
                },
                notifier,
                policy,
                shutdown,
            );
            Session {
                front,
                disk,
                notes,
                daemon,
            }
        }

        fn submit(&self, request: RequestSlot) -> usize {
            self.front.borrow_mut().submit(request)
        }
    }

    #[test]
    fn test_read_single_page() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        let slot = s.submit(RequestSlot::build(READ, 7, 0, &[(0, 7)]));
        let slot2 = s.submit(RequestSlot::build(READ, 8, 24, &[(2, 3)]));

        s.daemon.run().unwrap();

        let calls = s.disk.borrow().calls.clone();
        assert_eq!(
            calls,
            vec![
                Call::Read {
                    offset: 0,
                    len: 4096
                },
                Call::Read {
                    offset: 24 * 512,
                    len: 1024
                },
                Call::SkipFlush(true),
                Call::Close,
            ]
        );

        let mut front = s.front.borrow_mut();
        let responses = front.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id(), 7);
        assert_eq!(responses[0].operation(), READ);
        assert_eq!(responses[0].status(), 0);
        assert_eq!(responses[1].id(), 8);

        let mut page = vec![0u8; 4096];
        front.page(slot, 0).copy_to(&mut page);
        for (i, b) in page.iter().enumerate() {
            assert_eq!(*b, disk_byte(i as u64));
        }

        // The second read landed at sub-block 2 of its own slot's page, and nowhere else.
        front.page(slot2, 0).copy_to(&mut page);
        assert!(page[..1024].iter().all(|&b| b == 0));
        assert!(page[1024..1536].iter().all(|&b| b == 24));
        assert!(page[1536..2048].iter().all(|&b| b == 25));
        assert!(page[2048..].iter().all(|&b| b == 0));

        assert_eq!(s.notes.borrow().notifications, 2);
    }

    #[test]
    fn test_write_split_at_partial_page() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        {
            // Page 0 holds 0x11s, page 1 holds 0x22s.
            let front = s.front.borrow();
            front.page(0, 0).copy_from(&[0x11u8; 4096]);
            front.page(0, 1).copy_from(&[0x22u8; 4096]);
        }
        s.submit(RequestSlot::build(WRITE, 3, 100, &[(0, 3), (4, 7)]));

        s.daemon.run().unwrap();

        let disk = s.disk.borrow();
        assert_eq!(
            disk.calls,
            vec![
                Call::Write {
                    offset: 100 * 512,
                    len: 2048
                },
                Call::Write {
                    offset: 100 * 512 + 2048,
                    len: 2048
                },
                // Something was written, so the close time flush stays.
                Call::Close,
            ]
        );
        assert_eq!(disk.written[0], vec![0x11u8; 2048]);
        assert_eq!(disk.written[1], vec![0x22u8; 2048]);

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id(), 3);
        assert_eq!(responses[0].operation(), WRITE);
        assert_eq!(responses[0].status(), 0);
    }

    #[test]
    fn test_write_contiguous_run_is_one_call() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.submit(RequestSlot::build(READ, 1, 0, &[]));
        let write = RequestSlot::build(WRITE, 2, 8, &[(3, 7), (0, 7), (0, 7), (0, 0)]);
        s.submit(write);

        s.daemon.run().unwrap();

        let calls = s.disk.borrow().calls.clone();
        assert_eq!(
            calls[0],
            Call::Write {
                offset: 8 * 512,
                len: 2560 + 2 * 4096 + 512
            }
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(s.front.borrow_mut().responses().len(), 2);
    }

    #[test]
    fn test_backend_failure_halts() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.disk.borrow_mut().fail_on = Some(1);
        // Three partial segments make three calls; the second one fails.
        s.submit(RequestSlot::build(READ, 40, 0, &[(0, 3), (0, 3), (0, 3)]));
        s.submit(RequestSlot::build(READ, 41, 0, &[(0, 7)]));

        let err = s.daemon.run().unwrap_err();
        assert!(matches!(err, Error::BackendIo(_)));

        let calls = s.disk.borrow().calls.clone();
        assert_eq!(
            calls,
            vec![
                Call::Read {
                    offset: 0,
                    len: 2048
                },
                Call::Read {
                    offset: 2048,
                    len: 2048
                },
                Call::SkipFlush(true),
                Call::Close,
            ]
        );

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id(), 40);
        assert_eq!(responses[0].status(), -1);
    }

    #[test]
    fn test_backend_failure_continue() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Continue);
        s.disk.borrow_mut().fail_on = Some(0);
        s.submit(RequestSlot::build(WRITE, 40, 0, &[(0, 7)]));
        s.submit(RequestSlot::build(FLUSH, 41, 0, &[]));

        s.daemon.run().unwrap();

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 2);
        assert_eq!((responses[0].id(), responses[0].status()), (40, -1));
        assert_eq!((responses[1].id(), responses[1].status()), (41, 0));
        assert_eq!(s.disk.borrow().calls.last(), Some(&Call::Close));
    }

    #[test]
    fn test_unknown_operation_stops_without_response() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Continue);
        s.submit(RequestSlot::build(READ, 1, 0, &[(0, 7)]));
        s.submit(RequestSlot::build(0x42, 2, 0, &[]));
        s.submit(RequestSlot::build(READ, 3, 0, &[(0, 7)]));

        let err = s.daemon.run().unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownOperation {
                id: 2,
                operation: 0x42
            }
        ));

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id(), 1);

        let calls = s.disk.borrow().calls.clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(&calls[1..], &[Call::SkipFlush(true), Call::Close]);
        assert_eq!(s.notes.borrow().waits, 0);
    }

    #[test]
    fn test_flush_operations() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.submit(RequestSlot::build(FLUSH, 10, 0, &[]));
        s.daemon.run().unwrap();
        assert_eq!(
            s.disk.borrow().calls,
            vec![Call::Flush, Call::SkipFlush(true), Call::Close]
        );
        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses[0].operation(), FLUSH);

        // A barrier marks the session as having written.
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.submit(RequestSlot::build(BARRIER, 11, 0, &[]));
        s.daemon.run().unwrap();
        assert_eq!(s.disk.borrow().calls, vec![Call::Flush, Call::Close]);
        let responses = s.front.borrow_mut().responses();
        assert_eq!((responses[0].id(), responses[0].operation()), (11, BARRIER));
    }

    #[test]
    fn test_flush_failure_is_reported() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.disk.borrow_mut().fail_on = Some(0);
        s.submit(RequestSlot::build(FLUSH, 10, 0, &[]));
        s.submit(RequestSlot::build(FLUSH, 11, 0, &[]));

        assert!(matches!(s.daemon.run(), Err(Error::BackendIo(_))));
        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status(), -1);
    }

    #[test]
    fn test_invalid_request_answered_with_error() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.submit(RequestSlot::build(WRITE, 5, 0, &[(0, 7), (6, 9)]));
        s.submit(RequestSlot::build(READ, 6, 0, &[(0, 7)]));

        assert!(matches!(s.daemon.run(), Err(Error::InvalidRequest(_))));

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id(), 5);
        assert_eq!(responses[0].operation(), WRITE);
        assert_eq!(responses[0].status(), -1);
        // Nothing touched the disk for it, and it doesn't count as a write.
        assert_eq!(
            s.disk.borrow().calls,
            vec![Call::SkipFlush(true), Call::Close]
        );
    }

    #[test]
    fn test_invalid_request_continue() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Continue);
        let oversized = RequestSlot::build(READ, 5, 0, &[(0, 7)]).with_segment_count(40);
        s.submit(oversized);
        s.submit(RequestSlot::build(READ, 6, 0, &[(0, 7)]));

        s.daemon.run().unwrap();

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].status(), -1);
        assert_eq!(responses[1].status(), 0);
    }

    #[test]
    fn test_notification_failure_stops() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Continue);
        s.notes.borrow_mut().fail_notify = true;
        s.submit(RequestSlot::build(READ, 1, 0, &[(0, 7)]));
        s.submit(RequestSlot::build(READ, 2, 0, &[(0, 7)]));

        assert!(matches!(s.daemon.run(), Err(Error::Notification(_))));

        // The response was published even though the front end wasn't told.
        assert_eq!(s.front.borrow_mut().responses().len(), 1);
        assert_eq!(s.disk.borrow().io_count, 1);
    }

    #[test]
    fn test_producer_overflow_stops() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Continue);
        s.front.borrow_mut().set_req_prod(1000);

        assert!(matches!(
            s.daemon.run(),
            Err(Error::Ring(ring::Error::ProducerOverflow { .. }))
        ));
        assert!(s.front.borrow_mut().responses().is_empty());
        assert_eq!(s.disk.borrow().calls.last(), Some(&Call::Close));
    }

    #[test]
    fn test_shutdown_before_dispatch() {
        let shutdown = AtomicBool::new(true);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.submit(RequestSlot::build(WRITE, 1, 0, &[(0, 7)]));

        s.daemon.run().unwrap();

        assert!(s.front.borrow_mut().responses().is_empty());
        assert_eq!(
            s.disk.borrow().calls,
            vec![Call::SkipFlush(true), Call::Close]
        );
        assert_eq!(s.notes.borrow().waits, 0);
    }

    #[test]
    fn test_shutdown_during_dispatch_finishes_request() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.disk.borrow_mut().shutdown_on = Some(0);
        s.submit(RequestSlot::build(READ, 1, 0, &[(0, 3), (0, 7)]));
        s.submit(RequestSlot::build(READ, 2, 8, &[(0, 7)]));

        s.daemon.run().unwrap();

        // The request in flight completes all of its calls and is answered. The next one is
        // left in the ring.
        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), 1);
        assert_eq!((responses[0].id(), responses[0].status()), (1, 0));
        assert_eq!(
            s.disk.borrow().calls,
            vec![
                Call::Read {
                    offset: 0,
                    len: 2048
                },
                Call::Read {
                    offset: 2048,
                    len: 4096
                },
                Call::SkipFlush(true),
                Call::Close,
            ]
        );
        assert_eq!(s.notes.borrow().waits, 0);
    }

    #[test]
    fn test_setup_missing_image() {
        let channel = TempFile::new().unwrap();
        let image = TempFile::new().unwrap();
        let config = Config {
            image: image.as_path().to_path_buf(),
            channel: channel.as_path().to_path_buf(),
            io_error_policy: IoErrorPolicy::Halt,
        };
        drop(image);

        assert!(matches!(setup(&config), Err(Error::OpenImage(_))));
    }

    #[test]
    fn test_setup_missing_channel() {
        let image = TempFile::new().unwrap();
        image.as_file().write_all(&[0xaa; 4096]).unwrap();
        let channel = TempFile::new().unwrap();
        let config = Config {
            image: image.as_path().to_path_buf(),
            channel: channel.as_path().to_path_buf(),
            io_error_policy: IoErrorPolicy::Halt,
        };
        drop(channel);

        assert!(matches!(
            setup(&config),
            Err(Error::Device(device::Error::Open(_)))
        ));

        // The image was released and left as it was.
        let mut disk = RawImage::open(image.as_path(), true).unwrap();
        assert_eq!(disk.size().unwrap(), 4096);
        disk.close().unwrap();
    }

    #[test]
    fn test_waits_for_more_work() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Halt);
        s.notes
            .borrow_mut()
            .on_wait
            .push(RequestSlot::build(WRITE, 9, 16, &[(0, 7)]));

        s.daemon.run().unwrap();

        // One wait delivered the write, the second one ended the session.
        assert_eq!(s.notes.borrow().waits, 2);
        assert_eq!(
            s.disk.borrow().calls,
            vec![
                Call::Write {
                    offset: 16 * 512,
                    len: 4096
                },
                Call::Close
            ]
        );
        assert_eq!(s.front.borrow_mut().responses()[0].id(), 9);
    }

    #[test]
    fn test_responses_follow_request_order() {
        let shutdown = AtomicBool::new(false);
        let s = Session::new(&shutdown, IoErrorPolicy::Continue);
        let ops = [READ, WRITE, FLUSH, BARRIER, READ, WRITE];
        for (i, &op) in ops.iter().enumerate() {
            let id = 0x100 + i as u64;
            s.submit(RequestSlot::build(op, id, i as u64 * 8, &[(0, 7), (0, 1)]));
        }

        s.daemon.run().unwrap();

        let responses = s.front.borrow_mut().responses();
        assert_eq!(responses.len(), ops.len());
        for (i, (response, &op)) in responses.iter().zip(ops.iter()).enumerate() {
            assert_eq!(response.id(), 0x100 + i as u64);
            assert_eq!(response.operation(), op);
            assert_eq!(response.status(), 0);
        }
    }
}
