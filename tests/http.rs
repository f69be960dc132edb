//! HTTP decoding fed straight from a socket device.

use std::cell::RefCell;
use std::rc::Rc;

use evio::{
    BindOpts, ConnectOpts, DevId, FeedCtl, Hio, Htrd, HtrdHandler, HtrdOption, Htre, HttpMethod,
    ListenOpts, Ntime, Rd, RdCtl, Result, SckHandler, SckType, Skad, StopReq, WrRes,
};

mod util;
use util::{any_local_address, init_with_hio};

const CHUNKED_POST: &[u8] =
    b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

#[derive(Default)]
struct Shared {
    peeks: usize,
    pokes: usize,
    method: Option<HttpMethod>,
    content: Vec<u8>,
}

type Sh = Rc<RefCell<Shared>>;

struct Collect {
    sh: Sh,
}

impl HtrdHandler for Collect {
    fn peek(&mut self, re: &mut Htre, _ctl: &mut FeedCtl) -> Result<()> {
        let mut sh = self.sh.borrow_mut();
        sh.peeks += 1;
        sh.method = Some(re.method());
        Ok(())
    }

    fn poke(&mut self, re: &mut Htre, _ctl: &mut FeedCtl) -> Result<()> {
        let mut sh = self.sh.borrow_mut();
        sh.pokes += 1;
        sh.content = re.content().to_vec();
        Ok(())
    }
}

struct HttpListener {
    sh: Sh,
}

impl SckHandler for HttpListener {
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
        Ok(Box::new(HttpConn {
            htrd: Htrd::new(HtrdOption::default()),
            collect: Collect {
                sh: Rc::clone(&self.sh),
            },
        }))
    }
}

struct HttpConn {
    htrd: Htrd,
    collect: Collect,
}

impl SckHandler for HttpConn {
    fn on_read(
        &mut self,
        hio: &mut Hio,
        _dev: DevId,
        rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        if let Rd::Data(data) = rd {
            self.htrd.feed(data, &mut self.collect, false)?;
            if self.collect.sh.borrow().pokes > 0 {
                hio.stop(StopReq::Termination);
            }
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

struct SliceClient;

impl SckHandler for SliceClient {
    fn on_connect(&mut self, hio: &mut Hio, dev: DevId) -> Result<()> {
        // three separate submissions; the decoder reassembles whatever
        // segmentation the transport produces
        hio.dev_write(dev, &CHUNKED_POST[..30], 0, None)?;
        hio.dev_write(dev, &CHUNKED_POST[30..70], 0, None)?;
        hio.dev_write(dev, &CHUNKED_POST[70..], 0, None)
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
fn chunked_request_over_tcp() {
    let mut hio = init_with_hio();
    let sh: Sh = Rc::default();

    let listener = hio
        .sck_make(SckType::Tcp4, Box::new(HttpListener { sh: Rc::clone(&sh) }))
        .unwrap();
    let mut bind = BindOpts::new(any_local_address());
    bind.reuseaddr = true;
    hio.sck_bind(listener, &bind).unwrap();
    hio.sck_listen(listener, &ListenOpts::new(16)).unwrap();
    let addr = hio.sck_local_addr(listener).unwrap().to_socket_addr().unwrap();

    let client = hio.sck_make(SckType::Tcp4, Box::new(SliceClient)).unwrap();
    let mut opts = ConnectOpts::new(addr);
    opts.tmout = Some(Ntime::from_secs(5));
    hio.sck_connect(client, opts).unwrap();

    hio.loop_().unwrap();

    let sh = sh.borrow();
    assert_eq!(sh.peeks, 1);
    assert_eq!(sh.pokes, 1);
    assert_eq!(sh.method, Some(HttpMethod::Post));
    assert_eq!(sh.content, b"hello world");
}
