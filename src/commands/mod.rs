//! The commands of _dnshsm_.
pub mod resetkeys;
pub mod sign;
pub mod verify;

use crate::env::Env;

use super::error::Error;

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Sign a zone with keys held in a PKCS#11 token
    ///
    /// The zone is read from a file (or stdin), canonically ordered, given
    /// an NSEC or NSEC3 chain, and every RRset is signed with keys that
    /// live in the token. The signed zone is written to a file (or stdout)
    /// only after every signature succeeded.
    #[command(name = "sign")]
    Sign(self::sign::Sign),

    /// Check every signature of a previously signed zone
    ///
    /// Verification needs no token; it uses only the DNSKEY records
    /// published in the zone itself.
    #[command(name = "verify")]
    Verify(self::verify::Verify),

    /// Destroy all keys stored under a label in the token
    ///
    /// Resetting a label that holds no keys is not an error.
    #[command(name = "reset-keys")]
    ResetKeys(self::resetkeys::ResetKeys),
}

impl Command {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        match self {
            Self::Sign(sign) => sign.execute(env),
            Self::Verify(verify) => verify.execute(env),
            Self::ResetKeys(resetkeys) => resetkeys.execute(env),
        }
    }
}
