//! Integration tests: the dispatch engine and poll loop, driven through mock
//! devices.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use devline::{
    Command, CommandSet, ConfigBuilder, Device, DeviceCtx, DeviceFlags, Error, EventKind,
    Outcome, Phase, ReqToken, Request, RequestFlags, Runtime,
};

// ── Mock devices ───────────────────────────────────────────────────

#[derive(Default, Clone)]
struct Spy {
    calls: Arc<AtomicUsize>,
    inits: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
    quits: Arc<Mutex<Vec<&'static str>>>,
}

impl Spy {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// `Read` stays pending for `index` invocations, then completes.
/// `Connect` stays pending for `index` invocations, then fails.
/// `Write` panics.
struct Countdown {
    name: &'static str,
    spy: Spy,
    options: DeviceFlags,
    failing_inits: usize,
}

impl Countdown {
    fn new(name: &'static str, spy: &Spy) -> Self {
        Countdown {
            name,
            spy: spy.clone(),
            options: DeviceFlags::empty(),
            failing_inits: 0,
        }
    }
}

impl Device for Countdown {
    fn name(&self) -> &'static str {
        self.name
    }

    fn commands(&self) -> CommandSet {
        CommandSet::INIT
            | CommandSet::QUIT
            | CommandSet::OPEN
            | CommandSet::READ
            | CommandSet::WRITE
            | CommandSet::CONNECT
    }

    fn options(&self) -> DeviceFlags {
        self.options
    }

    fn init(&mut self) -> Result<(), Error> {
        self.spy.inits.fetch_add(1, Ordering::SeqCst);
        if self.failing_inits > 0 {
            self.failing_inits -= 1;
            return Err(Error::Config("not ready".into()));
        }
        Ok(())
    }

    fn quit(&mut self) -> Result<(), Error> {
        self.spy.quits.lock().unwrap().push(self.name);
        Ok(())
    }

    fn open(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.spy.calls.fetch_add(1, Ordering::SeqCst);
        if req.index > 0 {
            return Ok(Outcome::Pending);
        }
        req.flags.insert(RequestFlags::OPEN);
        Ok(Outcome::Done)
    }

    fn read(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.spy.calls.fetch_add(1, Ordering::SeqCst);
        if req.index > 0 {
            req.index -= 1;
        }
        if req.index > 0 {
            return Ok(Outcome::Pending);
        }
        req.actual = req.length;
        cx.signal(EventKind::Read);
        Ok(Outcome::Done)
    }

    fn write(&mut self, _req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.spy.calls.fetch_add(1, Ordering::SeqCst);
        panic!("write exploded");
    }

    fn connect(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.spy.calls.fetch_add(1, Ordering::SeqCst);
        if req.index > 0 {
            req.index -= 1;
            return Ok(Outcome::Pending);
        }
        Err(Error::from_os(libc::ECONNRESET))
    }
}

/// Services its whole pending list from a custom poller.
struct Batch {
    spy: Spy,
    options: DeviceFlags,
}

impl Device for Batch {
    fn name(&self) -> &'static str {
        "Batch"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::READ
    }

    fn options(&self) -> DeviceFlags {
        self.options
    }

    fn poll(&mut self, pending: &[ReqToken], cx: &mut DeviceCtx<'_>) -> Option<bool> {
        self.spy.polls.fetch_add(1, Ordering::SeqCst);
        for &token in pending {
            if let Some(req) = cx.request_mut(token) {
                req.actual = 1;
            }
            cx.signal_for(token, EventKind::Read);
            cx.complete(token);
        }
        Some(!pending.is_empty())
    }

    fn read(&mut self, _req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.spy.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Pending)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn runtime() -> Runtime {
    let config = ConfigBuilder::new().reap_children(false).build().unwrap();
    Runtime::new(config).unwrap()
}

fn read_request(rt: &mut Runtime, device: devline::DeviceId, polls: i64) -> ReqToken {
    let token = rt.make_request(device).unwrap();
    let req = rt.request_mut(token).unwrap();
    req.index = polls;
    req.length = 8;
    token
}

fn drain_events(rt: &Runtime) -> Vec<(EventKind, ReqToken)> {
    std::iter::from_fn(|| rt.next_event())
        .map(|e| (e.kind, e.request))
        .collect()
}

// ── Command routing ────────────────────────────────────────────────

#[test]
fn unsupported_command_never_reaches_device() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = rt.make_request(dev).unwrap();

    let err = rt.do_device(token, Command::Rename).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidCommand {
            device: "Mock",
            command: Command::Rename
        }
    ));
    assert_eq!(spy.calls(), 0);
    assert!(!rt.request(token).unwrap().is_pending());
}

#[test]
fn device_level_commands_are_rejected_on_requests() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = rt.make_request(dev).unwrap();

    for command in [Command::Init, Command::Quit] {
        let err = rt.do_device(token, command).unwrap_err();
        assert!(matches!(err, Error::InvalidCommand { .. }), "{command:?}");
    }
    assert_eq!(spy.calls(), 0);
}

#[test]
fn done_command_completes_in_one_call() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 0);

    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Done);
    let req = rt.request(token).unwrap();
    assert_eq!(req.actual, 8);
    assert_eq!(req.command(), Command::Read);
    assert!(!req.is_pending());
    assert_eq!(rt.pending_count(dev).unwrap(), 0);
    assert_eq!(drain_events(&rt), vec![(EventKind::Read, token)]);
}

// ── Initialization ─────────────────────────────────────────────────

#[test]
fn devices_initialize_lazily() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    assert!(!rt.device_flags(dev).unwrap().contains(DeviceFlags::INIT));

    let token = read_request(&mut rt, dev, 0);
    rt.do_device_sync(token, Command::Read).unwrap();
    rt.do_device_sync(token, Command::Read).unwrap();

    assert!(rt.device_flags(dev).unwrap().contains(DeviceFlags::INIT));
    assert_eq!(spy.inits.load(Ordering::SeqCst), 1);
}

#[test]
fn must_init_device_refuses_commands_until_initialized() {
    let spy = Spy::default();
    let mut rt = runtime();
    let mut device = Countdown::new("Strict", &spy);
    device.options = DeviceFlags::MUST_INIT;
    let dev = rt.register(Box::new(device));
    let token = read_request(&mut rt, dev, 0);

    let err = rt.do_device(token, Command::Read).unwrap_err();
    assert!(matches!(err, Error::DeviceUninitialized("Strict")));
    assert_eq!(spy.calls(), 0);
    assert_eq!(spy.inits.load(Ordering::SeqCst), 0);

    rt.init_device(dev).unwrap();
    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Done);
}

#[test]
fn failed_lazy_init_still_runs_command() {
    let spy = Spy::default();
    let mut rt = runtime();
    let mut device = Countdown::new("Mock", &spy);
    device.failing_inits = 1;
    let dev = rt.register(Box::new(device));
    let token = read_request(&mut rt, dev, 0);

    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Done);
    assert!(rt.device_flags(dev).unwrap().contains(DeviceFlags::INIT));
    assert_eq!(spy.calls(), 1);

    // Marked initialized, so init is not attempted again.
    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Done);
    assert_eq!(spy.inits.load(Ordering::SeqCst), 1);
}

#[test]
fn quit_runs_in_reverse_order_for_initialized_devices() {
    let spy = Spy::default();
    let mut rt = runtime();
    let first = rt.register(Box::new(Countdown::new("First", &spy)));
    rt.register(Box::new(Countdown::new("Idle", &spy)));
    let third = rt.register(Box::new(Countdown::new("Third", &spy)));
    rt.init_device(first).unwrap();
    rt.init_device(third).unwrap();

    drop(rt);
    assert_eq!(*spy.quits.lock().unwrap(), vec!["Third", "First"]);
}

// ── Failure boundary ───────────────────────────────────────────────

#[test]
fn handler_panic_becomes_fault() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 0);

    let err = rt.do_device(token, Command::Write).unwrap_err();
    match err {
        Error::Fault(text) => assert_eq!(text, "write exploded"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!rt.request(token).unwrap().is_pending());

    // The runtime and the request survive the panic.
    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Done);
}

// ── Pending bookkeeping ────────────────────────────────────────────

#[test]
fn pending_request_is_attached_once() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 5);

    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Pending);
    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Pending);
    assert!(rt.request(token).unwrap().is_pending());
    assert_eq!(rt.pending(dev).unwrap(), vec![token]);
}

#[test]
fn poll_completes_pending_request() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 2);

    assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Pending);
    assert!(drain_events(&rt).is_empty());

    assert_eq!(rt.poll_devices(), 1);
    let req = rt.request(token).unwrap();
    assert!(!req.is_pending());
    assert_eq!(req.actual, 8);
    assert_eq!(rt.pending_count(dev).unwrap(), 0);
    assert_eq!(drain_events(&rt), vec![(EventKind::Read, token)]);

    // Nothing left to do.
    assert_eq!(rt.poll_devices(), 0);
}

#[test]
fn one_pass_services_every_device() {
    let spy = Spy::default();
    let mut rt = runtime();
    let first = rt.register(Box::new(Countdown::new("First", &spy)));
    let second = rt.register(Box::new(Countdown::new("Second", &spy)));
    let a = read_request(&mut rt, first, 2);
    let b = read_request(&mut rt, second, 2);
    for token in [a, b] {
        assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Pending);
    }

    assert_eq!(rt.poll_devices(), 2);
    assert_eq!(rt.pending_count(first).unwrap(), 0);
    assert_eq!(rt.pending_count(second).unwrap(), 0);
    let events = drain_events(&rt);
    assert_eq!(events.len(), 2);
    assert!(events.contains(&(EventKind::Read, a)));
    assert!(events.contains(&(EventKind::Read, b)));
}

#[test]
fn poll_preserves_attach_order() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let a = read_request(&mut rt, dev, 2);
    let b = read_request(&mut rt, dev, 2);
    let c = read_request(&mut rt, dev, 3);
    for token in [a, b, c] {
        rt.do_device(token, Command::Read).unwrap();
    }
    assert_eq!(rt.pending(dev).unwrap(), vec![a, b, c]);

    assert_eq!(rt.poll_devices(), 1);
    assert_eq!(
        drain_events(&rt),
        vec![(EventKind::Read, a), (EventKind::Read, b)]
    );
    assert_eq!(rt.pending(dev).unwrap(), vec![c]);
}

#[test]
fn pending_without_progress_is_not_a_change() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 10);

    rt.do_device(token, Command::Read).unwrap();
    assert_eq!(rt.poll_devices(), 0);
    assert_eq!(spy.calls(), 2);
    assert!(rt.request(token).unwrap().is_pending());
}

#[test]
fn abort_detaches_without_completing() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 3);
    rt.do_device(token, Command::Read).unwrap();

    assert!(rt.abort(token).unwrap());
    assert!(!rt.abort(token).unwrap());
    assert!(!rt.request(token).unwrap().is_pending());
    assert_eq!(rt.poll_devices(), 0);
    assert_eq!(spy.calls(), 1);
}

#[test]
fn freed_token_is_stale() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 3);
    rt.do_device(token, Command::Read).unwrap();
    let live = rt.request_count();

    let req = rt.free_request(token).unwrap();
    assert!(!req.is_pending());
    assert_eq!(rt.request_count(), live - 1);
    assert_eq!(rt.pending_count(dev).unwrap(), 0);

    // The slot is reused, but the old token does not alias the new request.
    let fresh = rt.make_request(dev).unwrap();
    assert_eq!(fresh.index(), token.index());
    assert!(matches!(rt.request(token), Err(Error::InvalidRequest)));
    assert!(matches!(
        rt.do_device(token, Command::Read),
        Err(Error::InvalidRequest)
    ));
}

#[test]
fn sync_dispatch_reports_pending_as_error() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 3);

    let err = rt.do_device_sync(token, Command::Read).unwrap_err();
    assert!(matches!(err, Error::NotSynchronous(Command::Read)));
    assert!(rt.request(token).unwrap().is_pending());
    assert!(rt.abort(token).unwrap());
}

#[test]
fn failure_while_polling_is_stored_on_request() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = rt.make_request(dev).unwrap();
    rt.request_mut(token).unwrap().index = 1;

    assert_eq!(
        rt.do_device(token, Command::Connect).unwrap(),
        Outcome::Pending
    );
    assert_eq!(rt.poll_devices(), 1);

    let req = rt.request_mut(token).unwrap();
    assert!(!req.is_pending());
    assert!(req.flags.contains(RequestFlags::DONE));
    let err = req.take_error().expect("stored error");
    assert_eq!(err.os_code(), Some(libc::ECONNRESET));
    assert!(!req.has_error());
    assert_eq!(drain_events(&rt), vec![(EventKind::Error, token)]);
}

// ── Custom pollers ─────────────────────────────────────────────────

#[test]
fn custom_poller_completes_requests() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Batch {
        spy: spy.clone(),
        options: DeviceFlags::empty(),
    }));
    let a = rt.make_request(dev).unwrap();
    let b = rt.make_request(dev).unwrap();
    rt.do_device(a, Command::Read).unwrap();
    rt.do_device(b, Command::Read).unwrap();

    assert_eq!(rt.poll_devices(), 1);
    assert_eq!(spy.polls.load(Ordering::SeqCst), 1);
    // The custom poller replaces the default one: no handler re-invocation.
    assert_eq!(spy.calls(), 2);
    assert_eq!(rt.pending_count(dev).unwrap(), 0);
    assert_eq!(rt.request(a).unwrap().actual, 1);
    assert_eq!(
        drain_events(&rt),
        vec![(EventKind::Read, a), (EventKind::Read, b)]
    );
}

#[test]
fn idle_devices_are_skipped_unless_auto_polled() {
    let idle = Spy::default();
    let eager = Spy::default();
    let mut rt = runtime();
    rt.register(Box::new(Batch {
        spy: idle.clone(),
        options: DeviceFlags::empty(),
    }));
    rt.register(Box::new(Batch {
        spy: eager.clone(),
        options: DeviceFlags::AUTO_POLL,
    }));

    assert_eq!(rt.poll_devices(), 0);
    assert_eq!(rt.poll_devices(), 0);
    assert_eq!(idle.polls.load(Ordering::SeqCst), 0);
    assert_eq!(eager.polls.load(Ordering::SeqCst), 2);
}

// ── Events ─────────────────────────────────────────────────────────

#[test]
fn full_event_queue_drops_newest() {
    let spy = Spy::default();
    let config = ConfigBuilder::new()
        .reap_children(false)
        .event_queue_capacity(2)
        .build()
        .unwrap();
    let mut rt = Runtime::new(config).unwrap();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let tokens: Vec<_> = (0..3).map(|_| read_request(&mut rt, dev, 0)).collect();
    for &token in &tokens {
        assert_eq!(rt.do_device(token, Command::Read).unwrap(), Outcome::Done);
    }

    let events = drain_events(&rt);
    assert_eq!(
        events,
        vec![(EventKind::Read, tokens[0]), (EventKind::Read, tokens[1])]
    );
}

#[test]
fn event_receiver_sees_signals() {
    let spy = Spy::default();
    let mut rt = runtime();
    let events = rt.events();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = read_request(&mut rt, dev, 0);
    rt.do_device(token, Command::Read).unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::Read);
    assert_eq!(event.device, dev);
    assert_eq!(event.request, token);
}

// ── Boot phase ─────────────────────────────────────────────────────

#[test]
fn boot_open_only_before_start() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = rt.make_request(dev).unwrap();

    assert_eq!(rt.phase(), Phase::Boot);
    rt.boot_open(token).unwrap();
    assert!(rt.request(token).unwrap().flags.contains(RequestFlags::OPEN));
    assert!(rt.device_flags(dev).unwrap().contains(DeviceFlags::INIT));

    rt.start();
    assert_eq!(rt.phase(), Phase::Running);
    assert!(matches!(rt.boot_open(token), Err(Error::AlreadyStarted)));
}

#[test]
fn boot_open_must_finish_synchronously() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));
    let token = rt.make_request(dev).unwrap();
    rt.request_mut(token).unwrap().index = 1;

    let err = rt.boot_open(token).unwrap_err();
    assert!(matches!(err, Error::NotSynchronous(Command::Open)));
    // No pending-list bookkeeping on the boot path.
    assert_eq!(rt.pending_count(dev).unwrap(), 0);
}

// ── Registry ───────────────────────────────────────────────────────

#[test]
fn timer_is_device_zero() {
    let spy = Spy::default();
    let mut rt = runtime();
    let dev = rt.register(Box::new(Countdown::new("Mock", &spy)));

    assert_eq!(rt.timer_device().index(), 0);
    assert_eq!(rt.find_device("OS Events"), Some(rt.timer_device()));
    assert_eq!(rt.find_device("Mock"), Some(dev));
    assert_eq!(dev.index(), 1);
    assert_eq!(rt.find_device("Nope"), None);
}
