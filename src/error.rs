use std::fmt::Display;

/// Classification of kilndb errors. Kinds are coarse on purpose; the
/// diagnostic detail lives in the trace frames attached to [`Error`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Key not found by lookup/update/remove.
    NotFound,
    /// Insert of a key that already exists (and is not a ghost).
    Duplicate,
    /// Key + value exceed the maximum entry size of a page.
    RecordTooLarge,
    /// A key probed outside the fence range of the tree. Only possible when
    /// the tree is corrupt.
    KeyOutOfRange,
    /// `create` found data under the new root.
    IndexNotEmpty,
    /// A read returned fewer bytes than required.
    ShortIo,
    /// End of a log partition file.
    EndOfFile,
    /// A conditional latch acquisition or upgrade did not succeed.
    LatchTimeout,
    /// The buffer pool refused a write-order dependency (a cycle would form).
    WriteOrderCycle,
    /// An IO error, message carried from the OS.
    Io(String),
    /// Invalid on-disk data: corruption or unexpected internal values.
    InvalidData(String),
    /// Internal invariant violation. Not recoverable.
    Fatal(String),
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "key not found"),
            ErrorKind::Duplicate => write!(f, "duplicate key"),
            ErrorKind::RecordTooLarge => write!(f, "record too large"),
            ErrorKind::KeyOutOfRange => write!(f, "key outside tree fences"),
            ErrorKind::IndexNotEmpty => write!(f, "index not empty"),
            ErrorKind::ShortIo => write!(f, "short read"),
            ErrorKind::EndOfFile => write!(f, "end of file"),
            ErrorKind::LatchTimeout => write!(f, "conditional latch failed"),
            ErrorKind::WriteOrderCycle => write!(f, "write-order dependency refused"),
            ErrorKind::Io(msg) => write!(f, "io error: {msg}"),
            ErrorKind::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            ErrorKind::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

/// One hop of an error's propagation path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub file: &'static str,
    pub line: u32,
    pub context: Option<String>,
}

/// A kilndb error: a kind plus the chain of trace frames collected while the
/// error bubbled up. The first frame is the raise site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    frames: Vec<Frame>,
}

impl Error {
    pub fn new(kind: ErrorKind, file: &'static str, line: u32) -> Self {
        Self {
            kind,
            frames: vec![Frame {
                file,
                line,
                context: None,
            }],
        }
    }

    /// Appends a frame while propagating. Used by the `trace_err!` macro.
    #[must_use]
    pub fn traced(mut self, file: &'static str, line: u32, context: Option<String>) -> Self {
        self.frames.push(Frame {
            file,
            line,
            context,
        });
        self
    }

    pub fn is(&self, kind: &ErrorKind) -> bool {
        &self.kind == kind
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.frames {
            write!(f, "; at {}:{}", frame.file, frame.line)?;
            if let Some(context) = &frame.context {
                write!(f, " ({context})")?;
            }
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::EndOfFile,
            _ => ErrorKind::Io(err.to_string()),
        };
        Self {
            kind,
            frames: Vec::new(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self {
            kind: ErrorKind::Fatal(format!("poisoned lock: {err}")),
            frames: Vec::new(),
        }
    }
}

/// Raises an [`Error`] of the given kind at the current source location.
#[macro_export]
macro_rules! err {
    ($kind:expr) => {
        $crate::error::Error::new($kind, file!(), line!())
    };
}

/// Raises `Err(err!(..))`.
#[macro_export]
macro_rules! bail {
    ($kind:expr) => {
        return Err($crate::err!($kind))
    };
}

/// Constructs an `ErrorKind::InvalidData` error from a format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => {
        $crate::err!($crate::error::ErrorKind::InvalidData(format!($($args)*)))
    };
}

/// Constructs an `ErrorKind::Fatal` error from a format string.
#[macro_export]
macro_rules! errfatal {
    ($($args:tt)*) => {
        $crate::err!($crate::error::ErrorKind::Fatal(format!($($args)*)))
    };
}

/// Propagates a result, pushing a trace frame onto the error path.
///
/// ```ignore
/// let page = trace_err!(pool.fix(pid, LatchMode::Shared), "fixing child");
/// ```
#[macro_export]
macro_rules! trace_err {
    ($result:expr) => {
        $result.map_err(|e| e.traced(file!(), line!(), None))?
    };
    ($result:expr, $($ctx:tt)*) => {
        $result.map_err(|e| e.traced(file!(), line!(), Some(format!($($ctx)*))))?
    };
}

/// A kilndb Result returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn raise() -> Result<()> {
        bail!(ErrorKind::NotFound)
    }

    fn propagate() -> Result<()> {
        trace_err!(raise(), "looking up key {:?}", b"k1");
        Ok(())
    }

    #[test]
    fn trace_chain_collects_frames() {
        let err = propagate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.frames().len(), 2);
        assert!(err.frames()[1].context.as_deref().unwrap().contains("k1"));
    }

    #[test]
    fn display_prints_chain() {
        let err = propagate().unwrap_err();
        let printed = err.to_string();
        assert!(printed.starts_with("key not found"));
        assert!(printed.contains("error.rs"));
    }

    #[test]
    fn io_eof_maps_to_end_of_file() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io.into();
        assert_eq!(err.kind, ErrorKind::EndOfFile);
    }
}
