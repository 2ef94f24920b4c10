mod backend;
mod iocp;

pub(crate) use self::backend::{Backend, RawOp};
