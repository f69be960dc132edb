//! Single-threaded event-driven I/O runtime.
//!
//! evio drives a set of *devices* (sockets, pipes, anything with an OS
//! handle) from one cooperative loop built on the operating system's
//! readiness multiplexer: epoll on Linux, kqueue on the BSDs and macOS,
//! `poll(2)` everywhere else.
//!
//! The pieces:
//!
//! * [`Hio`] — the host context owning the loop, the timer wheel and
//!   every device.
//! * [`Device`]/[`EvCb`] — the driver and event-callback halves a
//!   custom device implements.
//! * The socket device ([`SckDev`], via [`Hio::sck_make`]) with
//!   non-blocking connect/accept progress, optional TLS handshake
//!   pumping and transparent-proxy detection.
//! * [`Htrd`] — an incremental HTTP/1.x stream decoder usable on any
//!   byte stream.
//!
//! # Example
//!
//! A device is created, watched and driven entirely through callbacks:
//!
//! ```no_run
//! use evio::{Feature, Hio, Rd, RdCtl, SckHandler, SckType};
//!
//! struct Echo;
//!
//! impl SckHandler for Echo {
//!     fn on_read(
//!         &mut self,
//!         hio: &mut evio::Hio,
//!         dev: evio::DevId,
//!         rd: Rd<'_>,
//!         _src: Option<&evio::Skad>,
//!     ) -> evio::Result<RdCtl> {
//!         if let Rd::Data(data) = rd {
//!             let data = data.to_vec();
//!             hio.dev_write(dev, &data, 0, None)?;
//!         }
//!         Ok(RdCtl::Again)
//!     }
//!
//!     fn on_write(
//!         &mut self,
//!         _hio: &mut evio::Hio,
//!         _dev: evio::DevId,
//!         _res: evio::WrRes,
//!         _ctx: usize,
//!         _dst: Option<&evio::Skad>,
//!     ) -> evio::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let mut hio = Hio::open(Feature::ALL, 64).unwrap();
//! let _sck = hio.sck_make(SckType::Tcp4, Box::new(Echo)).unwrap();
//! hio.loop_().unwrap();
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod macros;

mod cap;
mod err;
mod skad;
mod time;

pub use cap::{DevCap, DevEvent};
pub use err::{Errnum, Error, Result};
pub use skad::Skad;
pub use time::Ntime;

cfg_os_poll! {
    mod dev;
    mod hio;
    mod logwr;
    mod que;
    mod svc;
    mod sys;
    mod tls;
    mod tmr;

    pub use dev::{DevId, Device, EvCb, EvGate, Rd, RdCtl, WatchCmd, WrRes};
    pub use hio::{Feature, Hio, Opt, StopReq, Stopper};
    pub use logwr::{LineWriter, LogMask};
    pub use svc::{Service, SvcId};
    pub use tls::{SharedTlsContext, TlsContext, TlsSession, TlsWant};
    pub use tmr::Tmridx;
}

cfg_net! {
    mod sck;

    pub use sck::{
        BindOpts, ConnectOpts, ListenOpts, SckDev, SckHandler, SckIoctl, SckState, SckType,
        ShutHow,
    };
}

cfg_http! {
    mod htrd;
    mod htre;

    pub use htrd::{FeedCtl, Htrd, HtrdHandler, HtrdOption};
    pub use htre::{HeaderTable, Htre, HtreFlags, HtreType, HttpMethod, HttpVersion};
}

pub mod features {
    //! # Feature flags
    //!
    //! * `os-poll` (default) — the host context, selectors and event
    //!   loop.
    //! * `net` (default) — the socket device.
    //! * `http` (default) — the HTTP stream decoder.
    //! * `log` (default) — tracing through the `log` facade.
}
