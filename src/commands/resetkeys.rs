use std::path::PathBuf;

use crate::env::Env;
use crate::error::Error;
use crate::hsm::{KeyRing, Session};

//------------ ResetKeys -----------------------------------------------------

#[derive(Clone, Debug, clap::Args)]
pub struct ResetKeys {
    /// Path of the PKCS#11 module of the token
    #[arg(short = 'p', value_name = "library")]
    module: PathBuf,

    /// Label of the keys to destroy
    #[arg(short = 'l', value_name = "label", default_value = "dHSM-signer")]
    label: String,

    /// User PIN of the token
    #[arg(short = 'k', value_name = "pin", default_value = "1234")]
    pin: String,
}

impl ResetKeys {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let session = Session::open(&env.in_cwd(&self.module), &self.pin)?;
        let count = KeyRing::new(&session, &self.label).destroy_all()?;

        writeln!(
            env.stdout(),
            "destroyed {count} objects under label '{}'",
            self.label
        );
        Ok(())
    }
}
