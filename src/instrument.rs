use crate::resource::ResourceKind;
use crate::session::Session;
use crate::Result;

/// What every instrument can do regardless of model: be opened at an address, describe itself and
/// release its session.
///
/// Device drivers own a [`Session`] and implement this trait by handing it out; `describe` and
/// `close` then come for free.
pub trait Instrument {
    fn open(address: &str, kind: ResourceKind) -> Result<Self>
    where
        Self: Sized;

    fn session(&self) -> &Session;

    fn session_mut(&mut self) -> &mut Session;

    fn describe(&self) -> String {
        self.session().describe()
    }

    fn close(&mut self) -> Result<()> {
        self.session_mut().close()
    }
}

impl Instrument for Session {
    fn open(address: &str, kind: ResourceKind) -> Result<Self> {
        Session::open(address, kind)
    }

    fn session(&self) -> &Session {
        self
    }

    fn session_mut(&mut self) -> &mut Session {
        self
    }
}
