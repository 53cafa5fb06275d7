//! Shared test fixtures: an std-thread scheduler, a mock host servicing
//! both rings, and a recording upper layer.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::Thread;
use std::time::Duration;

use skiff_net::error::{IoctlError, ProbeError};
use skiff_net::pbuf::Pbuf;
use skiff_net::queue::{NetDevice, VirtQueue};
use skiff_net::sched::{Sched, ThreadHandle};
use skiff_net::types::EthernetAddress;
use skiff_net::upper::UpperLayer;

pub const TEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// `Sched` backed by std threads. CPU identity is a thread-local the test
/// pins explicitly; the timestamp is a global strictly monotonic counter.
pub struct StdSched {
    threads: Mutex<HashMap<u64, Thread>>,
    clock: AtomicI64,
    cpus: usize,
}

impl StdSched {
    pub fn new(cpus: usize) -> &'static Self {
        Box::leak(Box::new(Self {
            threads: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(1),
            cpus,
        }))
    }

    /// Pin the calling thread to a CPU id.
    pub fn set_cpu(cpu: usize) {
        CPU.with(|c| c.set(cpu));
    }
}

impl Sched for StdSched {
    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> usize {
        CPU.with(|c| c.get()) % self.cpus
    }

    fn preempt_disable(&self) {}
    fn preempt_enable(&self) {}

    fn now(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn current(&self) -> ThreadHandle {
        let id = THREAD_ID.with(|t| {
            if t.get() == 0 {
                t.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            t.get()
        });
        self.threads
            .lock()
            .unwrap()
            .insert(id, std::thread::current());
        ThreadHandle(id)
    }

    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send + 'static>) -> ThreadHandle {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                THREAD_ID.with(|t| t.set(id));
                ready_tx.send(std::thread::current()).unwrap();
                f();
            })
            .unwrap();
        let thread = ready_rx.recv().unwrap();
        self.threads.lock().unwrap().insert(id, thread);
        ThreadHandle(id)
    }

    fn park(&self) {
        // The timeout doubles as the spurious wake-up the trait allows.
        std::thread::park_timeout(Duration::from_millis(100));
    }

    fn unpark(&self, thread: &ThreadHandle) {
        if let Some(t) = self.threads.lock().unwrap().get(&thread.0) {
            t.unpark();
        }
    }
}

// ---------------------------------------------------------------------------
// Mock host + queues
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Frag {
    addr: usize,
    len: usize,
    write: bool,
}

struct Chain {
    token: u64,
    frags: Vec<Frag>,
    slots: usize,
}

struct QInner {
    sg: Vec<Frag>,
    avail: VecDeque<Chain>,
    used: VecDeque<(u64, u32, usize)>,
    finalize_pending: VecDeque<usize>,
    free_slots: usize,
    /// Chains published so far / announced by a doorbell / taken by the host.
    added: u64,
    announced: u64,
    processed: u64,
    /// Completion budget for the host worker; `u64::MAX` means unlimited.
    grants: u64,
}

pub struct HostState {
    size: u16,
    indirect: AtomicBool,
    q: Mutex<QInner>,
    used_cv: Condvar,
    host_cv: Condvar,
    kicks: AtomicU64,
    completed: AtomicU64,
    tx_log: Mutex<Vec<Vec<u8>>>,
}

// SAFETY: fragment addresses are plain integers here; all dereferences are
// in the worker/injector while the described memory is pinned by the
// in-flight request.
unsafe impl Send for HostState {}
unsafe impl Sync for HostState {}

impl HostState {
    fn new(size: u16, grants: u64) -> Arc<Self> {
        Arc::new(Self {
            size,
            indirect: AtomicBool::new(false),
            q: Mutex::new(QInner {
                sg: Vec::new(),
                avail: VecDeque::new(),
                used: VecDeque::new(),
                finalize_pending: VecDeque::new(),
                free_slots: size as usize,
                added: 0,
                announced: 0,
                processed: 0,
                grants,
            }),
            used_cv: Condvar::new(),
            host_cv: Condvar::new(),
            kicks: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            tx_log: Mutex::new(Vec::new()),
        })
    }
}

/// Host worker for the transmit queue: consumes announced chains, records
/// their payloads, produces completions.
fn host_worker(st: Arc<HostState>, latency: Duration) {
    loop {
        let chain = {
            let mut q = st.q.lock().unwrap();
            loop {
                if q.processed < q.announced && !q.avail.is_empty() && q.grants > 0 {
                    break;
                }
                q = st
                    .host_cv
                    .wait_timeout(q, Duration::from_millis(50))
                    .unwrap()
                    .0;
            }
            if q.grants != u64::MAX {
                q.grants -= 1;
            }
            q.processed += 1;
            q.avail.pop_front().unwrap()
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        // Capture the payload (everything after the net-header fragment)
        // before the completion makes the memory reclaimable.
        let mut payload = Vec::new();
        for frag in chain.frags.iter().skip(1).filter(|f| !f.write) {
            payload.extend_from_slice(unsafe {
                std::slice::from_raw_parts(frag.addr as *const u8, frag.len)
            });
        }
        st.tx_log.lock().unwrap().push(payload);

        let mut q = st.q.lock().unwrap();
        q.used.push_back((chain.token, 0, chain.slots));
        drop(q);
        st.completed.fetch_add(1, Ordering::Release);
        st.used_cv.notify_all();
    }
}

/// Test-side handle on one ring.
#[derive(Clone)]
pub struct HostHandle(Arc<HostState>);

impl HostHandle {
    /// Write one frame into posted receive buffers (one per element) and
    /// complete them. Blocks until enough buffers are posted.
    pub fn inject(&self, bufs: &[Vec<u8>]) {
        let st = &self.0;
        let mut q = st.q.lock().unwrap();
        while q.avail.len() < bufs.len() {
            q = st
                .host_cv
                .wait_timeout(q, Duration::from_millis(50))
                .unwrap()
                .0;
        }
        for data in bufs {
            let chain = q.avail.pop_front().unwrap();
            let frag = chain
                .frags
                .iter()
                .find(|f| f.write)
                .expect("posted rx chain has no writable fragment");
            let n = data.len().min(frag.len);
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), frag.addr as *mut u8, n);
            }
            q.used.push_back((chain.token, data.len() as u32, chain.slots));
            q.processed += 1;
        }
        drop(q);
        st.used_cv.notify_all();
    }

    /// Allow the (manual-mode) host worker to complete `n` more chains.
    pub fn grant(&self, n: u64) {
        let mut q = self.0.q.lock().unwrap();
        q.grants = q.grants.saturating_add(n);
        drop(q);
        self.0.host_cv.notify_all();
    }

    pub fn completed(&self) -> u64 {
        self.0.completed.load(Ordering::Acquire)
    }

    pub fn kicks(&self) -> u64 {
        self.0.kicks.load(Ordering::Relaxed)
    }

    /// Payloads of all transmitted frames, in host completion order.
    pub fn tx_frames(&self) -> Vec<Vec<u8>> {
        self.0.tx_log.lock().unwrap().clone()
    }
}

/// Driver-side endpoint of one mock ring.
pub struct MockQueue {
    st: Arc<HostState>,
}

impl VirtQueue for MockQueue {
    fn size(&self) -> u16 {
        self.st.size
    }

    fn set_indirect(&mut self, enable: bool) {
        self.st.indirect.store(enable, Ordering::Relaxed);
    }

    fn init_sg(&mut self) {
        self.st.q.lock().unwrap().sg.clear();
    }

    fn add_out(&mut self, addr: *const u8, len: usize) {
        self.st.q.lock().unwrap().sg.push(Frag {
            addr: addr as usize,
            len,
            write: false,
        });
    }

    fn add_in(&mut self, addr: *mut u8, len: usize) {
        self.st.q.lock().unwrap().sg.push(Frag {
            addr: addr as usize,
            len,
            write: true,
        });
    }

    fn sg_len(&self) -> usize {
        self.st.q.lock().unwrap().sg.len()
    }

    fn try_add_buf(&mut self, token: u64) -> bool {
        let indirect = self.st.indirect.load(Ordering::Relaxed);
        let mut q = self.st.q.lock().unwrap();
        let slots = if indirect { 1 } else { q.sg.len().max(1) };
        if q.free_slots < slots {
            return false;
        }
        q.free_slots -= slots;
        let frags = q.sg.clone();
        q.avail.push_back(Chain {
            token,
            frags,
            slots,
        });
        q.added += 1;
        drop(q);
        self.st.host_cv.notify_all();
        true
    }

    fn get_buf_elem(&mut self, len: &mut u32) -> Option<u64> {
        let mut q = self.st.q.lock().unwrap();
        let (token, l, slots) = q.used.pop_front()?;
        *len = l;
        q.finalize_pending.push_back(slots);
        Some(token)
    }

    fn get_buf_finalize(&mut self, count: u16) {
        let mut q = self.st.q.lock().unwrap();
        for _ in 0..count {
            if let Some(slots) = q.finalize_pending.pop_front() {
                q.free_slots += slots;
            }
        }
    }

    fn used_ring_not_empty(&self) -> bool {
        !self.st.q.lock().unwrap().used.is_empty()
    }

    fn avail_ring_has_room(&self, frags: usize) -> bool {
        let indirect = self.st.indirect.load(Ordering::Relaxed);
        let slots = if indirect { 1 } else { frags.max(1) };
        self.st.q.lock().unwrap().free_slots >= slots
    }

    fn refill_needed(&self) -> bool {
        let q = self.st.q.lock().unwrap();
        q.free_slots >= (self.st.size as usize) / 2
    }

    fn kick(&mut self) -> bool {
        let mut q = self.st.q.lock().unwrap();
        let host_idle = q.processed >= q.announced;
        q.announced = q.added;
        drop(q);
        self.st.kicks.fetch_add(1, Ordering::Relaxed);
        self.st.host_cv.notify_all();
        host_idle
    }

    fn disable_interrupts(&mut self) {}

    fn wait_for_used(&mut self) {
        let mut q = self.st.q.lock().unwrap();
        while q.used.is_empty() {
            q = self
                .st
                .used_cv
                .wait_timeout(q, Duration::from_millis(50))
                .unwrap()
                .0;
        }
    }
}

// ---------------------------------------------------------------------------
// Mock device
// ---------------------------------------------------------------------------

pub struct MockDevice {
    features: u64,
    reject_ack: bool,
    rx: Option<MockQueue>,
    tx: Option<MockQueue>,
    pub acked: Arc<AtomicU64>,
    pub driver_ok: Arc<AtomicBool>,
}

pub struct TestHost {
    pub rx: HostHandle,
    pub tx: HostHandle,
    pub acked: Arc<AtomicU64>,
    pub driver_ok: Arc<AtomicBool>,
}

pub struct MockConfig {
    pub features: u64,
    pub rx_size: u16,
    pub tx_size: u16,
    pub tx_latency: Duration,
    /// When set, the TX host completes nothing until `grant` is called.
    pub manual_tx: bool,
    pub reject_ack: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            features: skiff_net::driver::features::DRIVER_FEATURES,
            rx_size: 64,
            tx_size: 256,
            tx_latency: Duration::ZERO,
            manual_tx: false,
            reject_ack: false,
        }
    }
}

pub fn mock_device(config: MockConfig) -> (MockDevice, TestHost) {
    let rx = HostState::new(config.rx_size, 0);
    let tx = HostState::new(config.tx_size, if config.manual_tx { 0 } else { u64::MAX });

    {
        let tx = tx.clone();
        let latency = config.tx_latency;
        std::thread::spawn(move || host_worker(tx, latency));
    }

    let acked = Arc::new(AtomicU64::new(0));
    let driver_ok = Arc::new(AtomicBool::new(false));

    (
        MockDevice {
            features: config.features,
            reject_ack: config.reject_ack,
            rx: Some(MockQueue { st: rx.clone() }),
            tx: Some(MockQueue { st: tx.clone() }),
            acked: acked.clone(),
            driver_ok: driver_ok.clone(),
        },
        TestHost {
            rx: HostHandle(rx),
            tx: HostHandle(tx),
            acked,
            driver_ok,
        },
    )
}

impl NetDevice for MockDevice {
    type Queue = MockQueue;

    fn device_features(&self) -> u64 {
        self.features
    }

    fn ack_features(&mut self, features: u64) -> Result<(), ProbeError> {
        if self.reject_ack {
            return Err(ProbeError::FeatureNegotiation);
        }
        self.acked.store(features, Ordering::Relaxed);
        Ok(())
    }

    fn mac(&self) -> EthernetAddress {
        TEST_MAC
    }

    fn take_queue(&mut self, idx: u16) -> Result<MockQueue, ProbeError> {
        let slot = match idx {
            0 => &mut self.rx,
            1 => &mut self.tx,
            _ => return Err(ProbeError::QueueUnavailable(idx)),
        };
        slot.take().ok_or(ProbeError::QueueUnavailable(idx))
    }

    fn bind_irq(&mut self, _idx: u16, _thread: ThreadHandle) {}

    fn set_driver_ok(&mut self) {
        self.driver_ok.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Upper layer
// ---------------------------------------------------------------------------

pub struct TestUpper {
    pub received: Mutex<Vec<(Vec<u8>, u32)>>,
    pub running: AtomicBool,
    pub mac: Mutex<Option<EthernetAddress>>,
}

impl TestUpper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            mac: Mutex::new(None),
        })
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl UpperLayer for TestUpper {
    fn attach(&self, mac: EthernetAddress) {
        *self.mac.lock().unwrap() = Some(mac);
    }

    fn input(&self, packet: Pbuf) {
        let flags = packet.csum_flags;
        self.received.lock().unwrap().push((packet.to_vec(), flags));
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ether_ioctl(&self, cmd: u64) -> Result<(), IoctlError> {
        if cmd == 0xE7 {
            Ok(())
        } else {
            Err(IoctlError::Unsupported)
        }
    }
}

/// Poll until `cond` holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
