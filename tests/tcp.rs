//! Socket device end-to-end behavior on real TCP and datagram pairs.

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

use evio::{
    BindOpts, ConnectOpts, DevId, Device, Errnum, Hio, ListenOpts, Ntime, Rd, RdCtl, Result,
    SckDev, SckHandler, SckType, Skad, StopReq, WrRes,
};

mod util;
use util::{init_with_hio, millis};

#[derive(Default)]
struct Shared {
    server_got: Vec<u8>,
    client_got: Vec<u8>,
    eof_count: u32,
    tmout_count: u32,
    arm_at: Option<Ntime>,
    tmout_at: Option<Ntime>,
    connects: u32,
    disconnects: u32,
    disconnect_at: Option<Ntime>,
    write_done: u32,
    write_olen: usize,
    order: Vec<String>,
}

type Sh = Rc<RefCell<Shared>>;

/// No-op handler for sockets that only exist to be configured.
struct Quiet;

impl SckHandler for Quiet {
    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }
}

/*
 * ===== echo with a timed read =====
 */

struct EchoListener {
    sh: Sh,
}

impl SckHandler for EchoListener {
    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_accept(
        &mut self,
        _hio: &mut Hio,
        _listener: DevId,
        _conn: DevId,
    ) -> Result<Box<dyn SckHandler>> {
        Ok(Box::new(EchoConn {
            sh: Rc::clone(&self.sh),
        }))
    }
}

struct EchoConn {
    sh: Sh,
}

impl SckHandler for EchoConn {
    fn on_read(
        &mut self,
        hio: &mut Hio,
        dev: DevId,
        rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        match rd {
            Rd::Data(data) => {
                let data = data.to_vec();
                self.sh.borrow_mut().server_got.extend_from_slice(&data);
                hio.dev_write(dev, &data, 0, None)?;
                // no more data is coming; expect exactly one timeout
                self.sh.borrow_mut().arm_at = Some(hio.gettime());
                hio.dev_timedread(dev, true, Some(Ntime::from_millis(500)))?;
                Ok(RdCtl::Again)
            }
            Rd::Err(Errnum::Tmout) => {
                let mut sh = self.sh.borrow_mut();
                sh.tmout_count += 1;
                sh.tmout_at = Some(hio.gettime());
                drop(sh);
                hio.stop(StopReq::Termination);
                Ok(RdCtl::Stop)
            }
            _ => Ok(RdCtl::Stop),
        }
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }
}

struct EchoClient {
    sh: Sh,
}

impl SckHandler for EchoClient {
    fn on_connect(&mut self, hio: &mut Hio, dev: DevId) -> Result<()> {
        self.sh.borrow_mut().connects += 1;
        hio.dev_write(dev, b"ABCDE", 0, None)
    }

    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        if let Rd::Data(data) = rd {
            self.sh.borrow_mut().client_got.extend_from_slice(data);
        }
        Ok(RdCtl::Again)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }
}

#[test]
fn tcp_echo_with_timed_read() {
    let mut hio = init_with_hio();
    let sh: Sh = Rc::default();

    let listener = hio
        .sck_make(SckType::Tcp4, Box::new(EchoListener { sh: Rc::clone(&sh) }))
        .unwrap();
    let mut bind = BindOpts::new("127.0.0.1:19997".parse().unwrap());
    bind.reuseaddr = true;
    hio.sck_bind(listener, &bind).unwrap();
    hio.sck_listen(listener, &ListenOpts::new(128)).unwrap();

    let client = hio
        .sck_make(SckType::Tcp4, Box::new(EchoClient { sh: Rc::clone(&sh) }))
        .unwrap();
    let mut opts = ConnectOpts::new("127.0.0.1:19997".parse().unwrap());
    opts.tmout = Some(Ntime::from_secs(5));
    hio.sck_connect(client, opts).unwrap();

    hio.loop_().unwrap();

    let sh = sh.borrow();
    assert_eq!(sh.connects, 1);
    assert_eq!(sh.server_got, b"ABCDE");
    assert_eq!(sh.client_got, b"ABCDE");
    assert_eq!(sh.tmout_count, 1);

    let waited = millis(sh.tmout_at.unwrap() - sh.arm_at.unwrap());
    assert!(waited >= 450, "timed read fired early: {}ms", waited);
    assert!(waited <= 750, "timed read fired late: {}ms", waited);

    // the read timer was consumed; nothing is left scheduled
    assert_eq!(hio.tmrjob_count(), 0);
}

/*
 * ===== write-queue backpressure =====
 */

const BLOB_LEN: usize = 4 * 1024 * 1024;

struct BlobClient {
    sh: Sh,
}

impl SckHandler for BlobClient {
    fn on_connect(&mut self, hio: &mut Hio, dev: DevId) -> Result<()> {
        // shrink the send buffer so the blob cannot leave in one call
        let fd = hio.dev_with::<SckDev, _>(dev, |s| s.syshnd()).unwrap();
        let size: libc::c_int = 8 * 1024;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let blob = vec![0x5a_u8; BLOB_LEN];
        hio.dev_write(dev, &blob, 7, None)
    }

    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
    }

    fn on_write(
        &mut self,
        hio: &mut Hio,
        _dev: DevId,
        res: WrRes,
        ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        let mut sh = self.sh.borrow_mut();
        sh.write_done += 1;
        sh.write_olen = res.unwrap();
        assert_eq!(ctx, 7);
        drop(sh);
        hio.stop(StopReq::Termination);
        Ok(())
    }
}

#[test]
fn split_write_reports_original_length_once() {
    let mut hio = init_with_hio();
    let sh: Sh = Rc::default();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let reader = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut total = 0;
        let mut buf = [0u8; 65536];
        while total < BLOB_LEN {
            match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        total
    });

    let client = hio
        .sck_make(SckType::Tcp4, Box::new(BlobClient { sh: Rc::clone(&sh) }))
        .unwrap();
    let mut opts = ConnectOpts::new(addr);
    opts.tmout = Some(Ntime::from_secs(10));
    hio.sck_connect(client, opts).unwrap();

    hio.loop_().unwrap();
    drop(hio); // closes the socket so the reader thread finishes

    assert_eq!(reader.join().unwrap(), BLOB_LEN);
    let sh = sh.borrow();
    // a single completion carrying the original request length, no
    // matter how many partial writes it took
    assert_eq!(sh.write_done, 1);
    assert_eq!(sh.write_olen, BLOB_LEN);
}

/*
 * ===== connect timeout =====
 */

struct BlackholeClient {
    sh: Sh,
}

impl SckHandler for BlackholeClient {
    fn on_connect(&mut self, _hio: &mut Hio, _dev: DevId) -> Result<()> {
        self.sh.borrow_mut().connects += 1;
        Ok(())
    }

    fn on_disconnect(&mut self, hio: &mut Hio, _dev: DevId) {
        let mut sh = self.sh.borrow_mut();
        sh.disconnects += 1;
        sh.disconnect_at = Some(hio.gettime());
    }

    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }
}

#[test]
fn connect_timeout_halts_before_connecting() {
    let mut hio = init_with_hio();
    let sh: Sh = Rc::default();

    let client = hio
        .sck_make(SckType::Tcp4, Box::new(BlackholeClient { sh: Rc::clone(&sh) }))
        .unwrap();
    // TEST-NET-2 swallows the SYN
    let mut opts = ConnectOpts::new("198.51.100.1:1".parse().unwrap());
    opts.tmout = Some(Ntime::from_millis(300));
    let t0 = hio.gettime();
    if let Err(err) = hio.sck_connect(client, opts) {
        // no route to anywhere in this environment; nothing to measure
        eprintln!("skipping connect timeout test: {}", err);
        return;
    }

    // the timed-out device halts, then nothing remains to run
    hio.loop_().unwrap();

    let sh = sh.borrow();
    assert_eq!(sh.connects, 0, "must never reach the connected state");
    assert_eq!(sh.disconnects, 1);
    let waited = millis(sh.disconnect_at.unwrap() - t0);
    assert!(waited >= 280, "timed out early: {}ms", waited);
    assert!(waited <= 700, "timed out late: {}ms", waited);
}

/*
 * ===== zero-length write closes the stream once =====
 */

struct EofListener {
    sh: Sh,
}

impl SckHandler for EofListener {
    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_accept(
        &mut self,
        _hio: &mut Hio,
        _listener: DevId,
        _conn: DevId,
    ) -> Result<Box<dyn SckHandler>> {
        Ok(Box::new(EofConn {
            sh: Rc::clone(&self.sh),
        }))
    }
}

struct EofConn {
    sh: Sh,
}

impl SckHandler for EofConn {
    fn on_read(
        &mut self,
        hio: &mut Hio,
        _dev: DevId,
        rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        match rd {
            Rd::Data(data) => {
                self.sh.borrow_mut().server_got.extend_from_slice(data);
                Ok(RdCtl::Again)
            }
            Rd::Eof => {
                self.sh.borrow_mut().eof_count += 1;
                hio.stop(StopReq::Termination);
                Ok(RdCtl::Stop)
            }
            _ => Ok(RdCtl::Stop),
        }
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }
}

struct EofClient;

impl SckHandler for EofClient {
    fn on_connect(&mut self, hio: &mut Hio, dev: DevId) -> Result<()> {
        hio.dev_write(dev, b"X", 0, None)?;
        // zero-length write: end of the write half
        hio.dev_write(dev, &[], 0, None)?;
        // the half is closed now; further writes must be refused
        assert!(hio.dev_write(dev, b"no", 0, None).is_err());
        Ok(())
    }

    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        Ok(())
    }
}

#[test]
fn zero_length_write_signals_eof_exactly_once() {
    let mut hio = init_with_hio();
    let sh: Sh = Rc::default();

    let listener = hio
        .sck_make(SckType::Tcp4, Box::new(EofListener { sh: Rc::clone(&sh) }))
        .unwrap();
    let mut bind = BindOpts::new(util::any_local_address());
    bind.reuseaddr = true;
    hio.sck_bind(listener, &bind).unwrap();
    hio.sck_listen(listener, &ListenOpts::new(16)).unwrap();
    let addr = hio.sck_local_addr(listener).unwrap().to_socket_addr().unwrap();

    let client = hio.sck_make(SckType::Tcp4, Box::new(EofClient)).unwrap();
    let mut opts = ConnectOpts::new(addr);
    opts.tmout = Some(Ntime::from_secs(5));
    hio.sck_connect(client, opts).unwrap();

    hio.loop_().unwrap();

    let sh = sh.borrow();
    assert_eq!(sh.server_got, b"X");
    assert_eq!(sh.eof_count, 1);
}

/*
 * ===== completed writes are delivered before the next read =====
 */

struct QxOrder {
    sh: Sh,
    reads: u32,
}

impl SckHandler for QxOrder {
    fn on_read(
        &mut self,
        hio: &mut Hio,
        dev: DevId,
        rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        if let Rd::Data(data) = rd {
            self.reads += 1;
            self.sh
                .borrow_mut()
                .order
                .push(format!("rd:{}", String::from_utf8_lossy(data)));
            if self.reads == 1 {
                // a write issued here completes immediately; its
                // callback must still precede the next on_read
                hio.dev_write(dev, b"reply", 0, None)?;
            }
            if self.reads == 2 {
                hio.stop(StopReq::Termination);
            }
        }
        Ok(RdCtl::Again)
    }

    fn on_write(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        res: WrRes,
        _ctx: usize,
        _dst: Option<&Skad>,
    ) -> Result<()> {
        assert_eq!(res.unwrap(), 5);
        self.sh.borrow_mut().order.push("wr".to_string());
        Ok(())
    }
}

#[test]
fn write_completion_precedes_next_read() {
    let mut hio = init_with_hio();
    let sh: Sh = Rc::default();

    let qx = hio
        .sck_make(
            SckType::Qx,
            Box::new(QxOrder {
                sh: Rc::clone(&sh),
                reads: 0,
            }),
        )
        .unwrap();

    // land two datagrams before the loop runs so both are readable in
    // one dispatch
    let side = hio
        .dev_with::<SckDev, _>(qx, |s| s.qx_side_channel())
        .unwrap();
    unsafe {
        assert_eq!(libc::write(side, b"A".as_ptr() as *const _, 1), 1);
        assert_eq!(libc::write(side, b"B".as_ptr() as *const _, 1), 1);
    }

    hio.loop_().unwrap();

    let sh = sh.borrow();
    assert_eq!(sh.order, ["rd:A", "wr", "rd:B"]);
}

/*
 * ===== watch registration round-trips =====
 */

#[test]
fn watch_stop_start_round_trip() {
    use evio::{DevCap, DevEvent, WatchCmd};

    let mut hio = init_with_hio();
    let udp = hio.sck_make(SckType::Udp4, Box::new(Quiet)).unwrap();

    let cap = hio.dev_cap(udp).unwrap();
    assert!(cap.contains(DevCap::WATCH_STARTED));
    assert!(cap.contains(DevCap::IN_WATCHED));

    hio.dev_watch(udp, WatchCmd::Stop, DevEvent::EMPTY).unwrap();
    let cap = hio.dev_cap(udp).unwrap();
    assert!(!cap.contains(DevCap::WATCH_STARTED));
    assert!(!cap.contains(DevCap::IN_WATCHED));

    hio.dev_watch(udp, WatchCmd::Start, DevEvent::EMPTY).unwrap();
    let cap = hio.dev_cap(udp).unwrap();
    assert!(cap.contains(DevCap::WATCH_STARTED));
    assert!(cap.contains(DevCap::IN_WATCHED));

    hio.dev_kill(udp);
    assert_eq!(hio.device_count(), 0);
}

#[test]
fn disabling_reads_suspends_the_watch() {
    use evio::DevCap;

    let mut hio = init_with_hio();
    let udp = hio.sck_make(SckType::Udp4, Box::new(Quiet)).unwrap();

    hio.dev_read(udp, false).unwrap();
    let cap = hio.dev_cap(udp).unwrap();
    assert!(cap.contains(DevCap::IN_DISABLED));
    assert!(!cap.contains(DevCap::IN_WATCHED));
    assert!(cap.contains(DevCap::WATCH_SUSPENDED));

    // re-enabling must re-insert the handle into the multiplexer
    hio.dev_read(udp, true).unwrap();
    let cap = hio.dev_cap(udp).unwrap();
    assert!(!cap.contains(DevCap::IN_DISABLED));
    assert!(cap.contains(DevCap::IN_WATCHED));
    assert!(!cap.contains(DevCap::WATCH_SUSPENDED));
}

#[test]
fn vectored_write_coalesces_into_one_datagram() {
    use std::io::IoSlice;

    let mut hio = init_with_hio();
    let qx = hio.sck_make(SckType::Qx, Box::new(Quiet)).unwrap();
    let side = hio
        .dev_with::<SckDev, _>(qx, |s| s.qx_side_channel())
        .unwrap();

    hio.dev_writev(
        qx,
        &[IoSlice::new(b"foo"), IoSlice::new(b"bar")],
        0,
        None,
    )
    .unwrap();

    // an immediate completion means the datagram is already sitting in
    // the pair's buffer, as one message
    let mut buf = [0u8; 16];
    let n = unsafe { libc::read(side, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    assert_eq!(n, 6);
    assert_eq!(&buf[..6], b"foobar");

    hio.dev_kill(qx);
    assert_eq!(hio.device_count(), 0);
}

#[test]
fn bound_socket_reports_local_address() {
    let mut hio = init_with_hio();
    let listener = hio.sck_make(SckType::Tcp4, Box::new(Quiet)).unwrap();
    let mut bind = BindOpts::new(util::any_local_address());
    bind.reuseaddr = true;
    hio.sck_bind(listener, &bind).unwrap();

    let local = hio.sck_local_addr(listener).unwrap();
    assert_ne!(local.port(), 0);
    assert!(local.to_socket_addr().unwrap().ip().is_loopback());
}
