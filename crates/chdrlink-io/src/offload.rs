//! Offload I/O service: a dedicated worker thread owns the links.
//!
//! The worker runs an inline service internally and shuttles frames to and
//! from clients over bounded queues sized to each client's reserved frame
//! count, so the queues can never become a second point of backpressure
//! beyond the link's own pool. Clients only ever touch their queues, never
//! a link, which removes any need for a lock around link access.
//!
//! Connect, attach, and disconnect requests travel to the worker and are
//! serviced between work units; disconnect markers ride in the same queue as
//! released buffers so they are processed only after every preceding
//! release. Teardown drains every queue back to the links before the worker
//! exits — a stopped worker never strands a frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chdrlink_link::{FrameBuff, LinkId, RecvLink, SendLink};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IoError, Result};
use crate::inline::InlineIoService;
use crate::service::{
    IoService, RecvCallback, RecvFcCallback, RecvIo, SendCallback, SendFc, SendIo,
};

/// How long the worker blocks in one work unit before rechecking its queues
/// and the stop flag.
const BLOCKING_TIMEOUT: Duration = Duration::from_millis(100);

/// How the worker thread waits for link activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Spin over clients, yielding between idle passes.
    Poll,
    /// Block in the link driver up to a bounded interval.
    Block,
}

/// Which client classes an offload service instance accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    RecvOnly,
    SendOnly,
    Both,
}

/// Deployment parameters for an offload service, handed over by the
/// device/property layer as plain key/value configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadArgs {
    pub wait_mode: WaitMode,
    pub client_type: ClientType,
}

impl Default for OffloadArgs {
    fn default() -> Self {
        Self {
            wait_mode: WaitMode::Poll,
            client_type: ClientType::Both,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fixed-capacity queue with blocking pop. Pushers never wait: capacities
/// are chosen so that, by construction, a push cannot overflow.
struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, item: T) {
        let mut items = lock(&self.items);
        debug_assert!(items.len() < self.capacity, "bounded queue overflow");
        items.push_back(item);
        drop(items);
        self.ready.notify_one();
    }

    fn try_pop(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut items = lock(&self.items);
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            match deadline {
                None => {
                    items = self
                        .ready
                        .wait(items)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(items, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    items = guard;
                }
            }
        }
    }
}

enum ToWorker {
    Release(FrameBuff),
    Disconnect,
}

/// Queue pair connecting one client handle to the worker thread. This is the
/// only state a client handle ever touches.
struct ClientPort {
    to_client: BoundedQueue<FrameBuff>,
    to_worker: BoundedQueue<ToWorker>,
    disconnected: Mutex<bool>,
    disconnected_cv: Condvar,
}

impl ClientPort {
    fn new(num_frames: usize) -> Self {
        Self {
            to_client: BoundedQueue::new(num_frames),
            // One extra slot so the disconnect marker rides in-line with
            // released buffers.
            to_worker: BoundedQueue::new(num_frames + 1),
            disconnected: Mutex::new(false),
            disconnected_cv: Condvar::new(),
        }
    }

    fn mark_disconnected(&self) {
        *lock(&self.disconnected) = true;
        self.disconnected_cv.notify_all();
    }

    fn wait_disconnected(&self) {
        let mut disconnected = lock(&self.disconnected);
        while !*disconnected {
            disconnected = self
                .disconnected_cv
                .wait(disconnected)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

enum Request {
    AttachRecv(Arc<dyn RecvLink>, SyncSender<Result<()>>),
    AttachSend(Arc<dyn SendLink>, SyncSender<Result<()>>),
    DetachRecv(LinkId, SyncSender<Result<()>>),
    DetachSend(LinkId, SyncSender<Result<()>>),
    ConnectRecv {
        link: Arc<dyn RecvLink>,
        num_frames: usize,
        recv_cb: RecvCallback,
        fc_cb: Option<RecvFcCallback>,
        port: Arc<ClientPort>,
        ack: SyncSender<Result<()>>,
    },
    ConnectSend {
        link: Arc<dyn SendLink>,
        num_frames: usize,
        send_cb: SendCallback,
        fc: Option<SendFc>,
        port: Arc<ClientPort>,
        ack: SyncSender<Result<()>>,
    },
}

struct Shared {
    stop: AtomicBool,
    requests: Mutex<Option<Sender<Request>>>,
}

impl Shared {
    fn send_request(&self, request: Request) -> Result<()> {
        let requests = lock(&self.requests);
        match requests.as_ref() {
            Some(tx) => tx.send(request).map_err(|_| IoError::Shutdown),
            None => Err(IoError::Shutdown),
        }
    }
}

/// I/O service whose links are driven exclusively by one worker thread.
pub struct OffloadIoService {
    shared: Arc<Shared>,
    args: OffloadArgs,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for OffloadIoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadIoService")
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl OffloadIoService {
    pub fn new(args: OffloadArgs) -> Result<Self> {
        if args.wait_mode == WaitMode::Block && args.client_type == ClientType::Both {
            return Err(IoError::Configuration(
                "a blocking offload service must serve only send or only recv clients, \
                 or one client class starves the other"
                    .to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            requests: Mutex::new(Some(tx)),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_args = args.clone();
        let worker = std::thread::Builder::new()
            .name("chdrlink-io-offload".to_string())
            .spawn(move || Worker::new(worker_shared, worker_args, rx).run())?;

        Ok(Self {
            shared,
            args,
            worker: Some(worker),
        })
    }

    fn roundtrip(&self, make: impl FnOnce(SyncSender<Result<()>>) -> Request) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.shared.send_request(make(ack_tx))?;
        ack_rx.recv().map_err(|_| IoError::Shutdown)?
    }
}

impl IoService for OffloadIoService {
    fn attach_recv_link(&self, link: Arc<dyn RecvLink>) -> Result<()> {
        self.roundtrip(|ack| Request::AttachRecv(link, ack))
    }

    fn attach_send_link(&self, link: Arc<dyn SendLink>) -> Result<()> {
        self.roundtrip(|ack| Request::AttachSend(link, ack))
    }

    fn detach_recv_link(&self, link_id: LinkId) -> Result<()> {
        self.roundtrip(|ack| Request::DetachRecv(link_id, ack))
    }

    fn detach_send_link(&self, link_id: LinkId) -> Result<()> {
        self.roundtrip(|ack| Request::DetachSend(link_id, ack))
    }

    fn make_recv_client(
        &self,
        recv_link: Arc<dyn RecvLink>,
        num_recv_frames: usize,
        recv_cb: RecvCallback,
        fc_cb: Option<RecvFcCallback>,
    ) -> Result<Box<dyn RecvIo>> {
        if self.args.client_type == ClientType::SendOnly {
            return Err(IoError::Configuration(
                "recv clients not supported by this I/O service".to_string(),
            ));
        }
        let port = Arc::new(ClientPort::new(num_recv_frames));
        self.roundtrip(|ack| Request::ConnectRecv {
            link: recv_link,
            num_frames: num_recv_frames,
            recv_cb,
            fc_cb,
            port: Arc::clone(&port),
            ack,
        })?;
        Ok(Box::new(OffloadRecvIo {
            port,
            num_recv_frames,
        }))
    }

    fn make_send_client(
        &self,
        send_link: Arc<dyn SendLink>,
        num_send_frames: usize,
        send_cb: SendCallback,
        fc: Option<SendFc>,
    ) -> Result<Box<dyn SendIo>> {
        if self.args.client_type == ClientType::RecvOnly {
            return Err(IoError::Configuration(
                "send clients not supported by this I/O service".to_string(),
            ));
        }
        let port = Arc::new(ClientPort::new(num_send_frames));
        self.roundtrip(|ack| Request::ConnectSend {
            link: send_link,
            num_frames: num_send_frames,
            send_cb,
            fc,
            port: Arc::clone(&port),
            ack,
        })?;
        Ok(Box::new(OffloadSendIo {
            port,
            num_send_frames,
        }))
    }
}

impl Drop for OffloadIoService {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        // Close the request channel so the worker cannot miss the stop.
        lock(&self.shared.requests).take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("offload worker exited by panic");
            }
        }
    }
}

struct OffloadRecvIo {
    port: Arc<ClientPort>,
    num_recv_frames: usize,
}

impl std::fmt::Debug for OffloadRecvIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadRecvIo")
            .field("num_recv_frames", &self.num_recv_frames)
            .finish_non_exhaustive()
    }
}

impl RecvIo for OffloadRecvIo {
    fn get_recv_buff(&mut self, timeout: Option<Duration>) -> Option<FrameBuff> {
        self.port.to_client.pop(timeout)
    }

    fn release_recv_buff(&mut self, frame: FrameBuff) {
        self.port.to_worker.push(ToWorker::Release(frame));
    }

    fn num_recv_frames(&self) -> usize {
        self.num_recv_frames
    }
}

impl Drop for OffloadRecvIo {
    fn drop(&mut self) {
        self.port.to_worker.push(ToWorker::Disconnect);
        self.port.wait_disconnected();
    }
}

struct OffloadSendIo {
    port: Arc<ClientPort>,
    num_send_frames: usize,
}

impl std::fmt::Debug for OffloadSendIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadSendIo")
            .field("num_send_frames", &self.num_send_frames)
            .finish_non_exhaustive()
    }
}

impl SendIo for OffloadSendIo {
    fn get_send_buff(&mut self, timeout: Option<Duration>) -> Option<FrameBuff> {
        self.port.to_client.pop(timeout)
    }

    fn release_send_buff(&mut self, frame: FrameBuff) {
        self.port.to_worker.push(ToWorker::Release(frame));
    }

    fn num_send_frames(&self) -> usize {
        self.num_send_frames
    }
}

impl Drop for OffloadSendIo {
    fn drop(&mut self) {
        self.port.to_worker.push(ToWorker::Disconnect);
        self.port.wait_disconnected();
    }
}

struct RecvClientState {
    port: Arc<ClientPort>,
    io: Box<dyn RecvIo>,
    in_flight: usize,
    num_frames: usize,
    disconnect: bool,
}

struct SendClientState {
    port: Arc<ClientPort>,
    io: Box<dyn SendIo>,
    in_flight: usize,
    num_frames: usize,
    disconnect: bool,
}

/// The offload thread: owns the inner inline service and every link
/// attached to it.
struct Worker {
    shared: Arc<Shared>,
    args: OffloadArgs,
    requests: Receiver<Request>,
    io_srv: InlineIoService,
    recv_clients: Vec<RecvClientState>,
    send_clients: Vec<SendClientState>,
}

impl Worker {
    fn new(shared: Arc<Shared>, args: OffloadArgs, requests: Receiver<Request>) -> Self {
        Self {
            shared,
            args,
            requests,
            io_srv: InlineIoService::new(),
            recv_clients: Vec::new(),
            send_clients: Vec::new(),
        }
    }

    fn run(mut self) {
        debug!(args = ?self.args, "offload worker started");
        loop {
            self.service_requests();

            if self.shared.stop.load(Ordering::Acquire) {
                self.teardown();
                debug!("offload worker stopped");
                return;
            }

            let link_timeout = match self.args.wait_mode {
                WaitMode::Poll => Some(Duration::ZERO),
                WaitMode::Block => Some(BLOCKING_TIMEOUT),
            };

            let mut did_work = false;
            did_work |= self.pump_recv_clients(link_timeout);
            did_work |= self.pump_send_clients(link_timeout);
            self.reap_disconnected();

            if !did_work && self.args.wait_mode == WaitMode::Poll {
                std::thread::yield_now();
            }
        }
    }

    fn service_requests(&mut self) {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.handle_request(request),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::AttachRecv(link, ack) => {
                let _ = ack.send(self.io_srv.attach_recv_link(link));
            }
            Request::AttachSend(link, ack) => {
                let _ = ack.send(self.io_srv.attach_send_link(link));
            }
            Request::DetachRecv(link_id, ack) => {
                let _ = ack.send(self.io_srv.detach_recv_link(link_id));
            }
            Request::DetachSend(link_id, ack) => {
                let _ = ack.send(self.io_srv.detach_send_link(link_id));
            }
            Request::ConnectRecv {
                link,
                num_frames,
                recv_cb,
                fc_cb,
                port,
                ack,
            } => {
                let result = self
                    .io_srv
                    .make_recv_client(link, num_frames, recv_cb, fc_cb);
                let _ = ack.send(result.map(|io| {
                    self.recv_clients.push(RecvClientState {
                        port,
                        io,
                        in_flight: 0,
                        num_frames,
                        disconnect: false,
                    });
                }));
            }
            Request::ConnectSend {
                link,
                num_frames,
                send_cb,
                fc,
                port,
                ack,
            } => {
                let result = self.io_srv.make_send_client(link, num_frames, send_cb, fc);
                let _ = ack.send(result.map(|io| {
                    self.send_clients.push(SendClientState {
                        port,
                        io,
                        in_flight: 0,
                        num_frames,
                        disconnect: false,
                    });
                }));
            }
        }
    }

    fn pump_recv_clients(&mut self, link_timeout: Option<Duration>) -> bool {
        let mut did_work = false;
        for client in &mut self.recv_clients {
            while let Some(msg) = client.port.to_worker.try_pop() {
                match msg {
                    ToWorker::Release(frame) => {
                        client.io.release_recv_buff(frame);
                        client.in_flight -= 1;
                        did_work = true;
                    }
                    ToWorker::Disconnect => {
                        client.disconnect = true;
                        did_work = true;
                    }
                }
            }
            if client.disconnect {
                continue;
            }
            if client.in_flight < client.num_frames {
                if let Some(frame) = client.io.get_recv_buff(link_timeout) {
                    client.in_flight += 1;
                    client.port.to_client.push(frame);
                    did_work = true;
                }
            }
        }
        did_work
    }

    fn pump_send_clients(&mut self, link_timeout: Option<Duration>) -> bool {
        let mut did_work = false;
        for client in &mut self.send_clients {
            while let Some(msg) = client.port.to_worker.try_pop() {
                match msg {
                    ToWorker::Release(frame) => {
                        client.io.release_send_buff(frame);
                        client.in_flight -= 1;
                        did_work = true;
                    }
                    ToWorker::Disconnect => {
                        client.disconnect = true;
                        did_work = true;
                    }
                }
            }
            if client.disconnect {
                continue;
            }
            if client.in_flight < client.num_frames {
                if let Some(frame) = client.io.get_send_buff(link_timeout) {
                    client.in_flight += 1;
                    client.port.to_client.push(frame);
                    did_work = true;
                }
            }
        }
        did_work
    }

    fn reap_disconnected(&mut self) {
        let mut index = 0;
        while index < self.recv_clients.len() {
            if self.recv_clients[index].disconnect {
                let mut client = self.recv_clients.remove(index);
                Self::flush_recv_client(&mut client);
                client.port.mark_disconnected();
            } else {
                index += 1;
            }
        }
        let mut index = 0;
        while index < self.send_clients.len() {
            if self.send_clients[index].disconnect {
                let mut client = self.send_clients.remove(index);
                Self::flush_send_client(&mut client);
                client.port.mark_disconnected();
            } else {
                index += 1;
            }
        }
    }

    /// Return every frame still in a recv client's queues to the link pool.
    fn flush_recv_client(client: &mut RecvClientState) {
        while let Some(msg) = client.port.to_worker.try_pop() {
            if let ToWorker::Release(frame) = msg {
                client.io.release_recv_buff(frame);
            }
        }
        while let Some(frame) = client.port.to_client.try_pop() {
            client.io.release_recv_buff(frame);
        }
    }

    /// Recycle every frame still in a send client's queues without
    /// transmitting it.
    fn flush_send_client(client: &mut SendClientState) {
        while let Some(msg) = client.port.to_worker.try_pop() {
            if let ToWorker::Release(frame) = msg {
                client.io.release_send_buff(frame);
            }
        }
        while let Some(mut frame) = client.port.to_client.try_pop() {
            frame.set_len(0);
            client.io.release_send_buff(frame);
        }
    }

    /// Shutdown path: every client still connected is flushed so that pool
    /// occupancy after teardown equals pool occupancy before attach.
    fn teardown(&mut self) {
        for mut client in self.recv_clients.drain(..) {
            Self::flush_recv_client(&mut client);
            client.port.mark_disconnected();
        }
        for mut client in self.send_clients.drain(..) {
            Self::flush_send_client(&mut client);
            client.port.mark_disconnected();
        }
    }
}
