use std::fmt;
use std::io;

use tracing::error;

use crate::env::Env;

//------------ ErrorKind -----------------------------------------------------

/// The broad category of an error, determining the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The command line could not be interpreted.
    Usage,

    /// Reading input or writing output failed.
    Io,

    /// The zone (or a name within it) could not be parsed.
    Parse,

    /// The PKCS#11 token misbehaved or rejected us.
    Hsm,

    /// A signed zone failed validation.
    Verification,
}

impl ErrorKind {
    fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Usage => 1,
            ErrorKind::Io => 2,
            ErrorKind::Parse => 3,
            ErrorKind::Hsm => 4,
            ErrorKind::Verification => 5,
        }
    }
}

//------------ Error ---------------------------------------------------------

/// A program error.
///
/// Such errors are highly likely to halt the program.
pub struct Error(Box<Information>);

/// Information about an error.
struct Information {
    /// The primary error message.
    primary: PrimaryError,

    /// The category the error falls into.
    kind: ErrorKind,

    /// Layers of context to the error.
    ///
    /// Ordered from innermost to outermost.
    context: Vec<Box<str>>,
}

#[derive(Debug)]
enum PrimaryError {
    Clap(clap::Error),
    Other(Box<str>),
}

impl fmt::Display for PrimaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryError::Clap(e) => e.fmt(f),
            PrimaryError::Other(e) => e.fmt(f),
        }
    }
}

//--- Interaction

impl Error {
    /// Construct a new error from a string and a category.
    pub fn new(kind: ErrorKind, error: impl fmt::Display) -> Self {
        Self(Box::new(Information {
            primary: PrimaryError::Other(error.to_string().into()),
            kind,
            context: Vec::new(),
        }))
    }

    pub fn usage(error: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Usage, error)
    }

    pub fn io(error: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Io, error)
    }

    pub fn parse(error: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Parse, error)
    }

    pub fn hsm(error: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Hsm, error)
    }

    pub fn verification(error: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Verification, error)
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Add context to this error.
    pub fn context(mut self, context: &str) -> Self {
        self.0.context.push(context.into());
        self
    }

    /// Pretty-print this error.
    pub fn pretty_print(&self, env: impl Env) {
        let msg = match &self.0.primary {
            // Clap errors are already styled. We don't want our own pretty
            // styling around that and context does not make sense for command
            // line arguments either. So we just print the styled string that
            // clap produces and return.
            PrimaryError::Clap(e) => {
                let mut err = env.stderr();
                writeln!(err, "{}", e.render().ansi());
                return;
            }
            PrimaryError::Other(error) => error,
        };

        let mut buf = String::new();
        for context in &self.0.context {
            buf.push_str(&format!("... while {context}\n"));
        }
        error!("{msg}\n{buf}");
    }

    pub fn exit_code(&self) -> u8 {
        // Clap prints help and version output through its error path with an
        // exit code of zero; keep that. Everything else maps onto the fixed
        // code for its category.
        if let PrimaryError::Clap(e) = &self.0.primary {
            if e.exit_code() == 0 {
                return 0;
            }
        }
        self.0.kind.exit_code()
    }
}

//--- Conversions for '?'

impl From<fmt::Error> for Error {
    fn from(error: fmt::Error) -> Self {
        Self::io(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::io(error)
    }
}

impl From<cryptoki::error::Error> for Error {
    fn from(error: cryptoki::error::Error) -> Self {
        Self::hsm(error)
    }
}

impl From<clap::Error> for Error {
    fn from(value: clap::Error) -> Self {
        Self(Box::new(Information {
            primary: PrimaryError::Clap(value),
            kind: ErrorKind::Usage,
            context: Vec::new(),
        }))
    }
}

//--- Display, Debug

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.primary.fmt(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("primary", &self.0.primary)
            .field("kind", &self.0.kind)
            .field("context", &self.0.context)
            .finish()
    }
}

//--- Error

impl std::error::Error for Error {}

//------------ Result --------------------------------------------------------

/// A program result.
pub type Result<T> = core::result::Result<T, Error>;

/// An extension trait for [`Result`]s using [`Error`].
pub trait Context: Sized {
    /// Add context for an error.
    fn context(self, context: &str) -> Self;

    /// Add context for an error, lazily.
    fn with_context(self, context: impl FnOnce() -> String) -> Self;
}

impl<T> Context for Result<T> {
    fn context(self, context: &str) -> Self {
        self.map_err(|err| err.context(context))
    }

    fn with_context(self, context: impl FnOnce() -> String) -> Self {
        self.map_err(|err| err.context(&(context)()))
    }
}
