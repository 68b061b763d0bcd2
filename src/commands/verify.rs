use std::fs::File;
use std::path::PathBuf;

use bytes::Bytes;
use clap::builder::ValueParser;
use domain::base::Name;
use domain::rdata::dnssec::Timestamp;

use crate::env::Env;
use crate::error::{Context, Error};
use crate::records;
use crate::{parse, verify};

//------------ Verify --------------------------------------------------------

#[derive(Clone, Debug, clap::Args)]
pub struct Verify {
    /// The signed zone file to check [default: stdin]
    #[arg(short = 'f', value_name = "file")]
    zonefile: Option<PathBuf>,

    /// Expected apex of the zone [default: taken from the SOA record]
    #[arg(
        short = 'z',
        value_name = "zone",
        value_parser = ValueParser::new(Verify::parse_name_arg),
    )]
    zone: Option<Name<Bytes>>,
}

impl Verify {
    fn parse_name_arg(arg: &str) -> Result<Name<Bytes>, clap::Error> {
        parse::parse_name(arg)
            .map_err(|err| clap::Error::raw(clap::error::ErrorKind::InvalidValue, err))
    }

    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let records = match &self.zonefile {
            Some(path) => {
                let file = File::open(env.in_cwd(path)).map_err(|err| {
                    Error::io(format!("cannot open '{}': {err}", path.display()))
                })?;
                records::load_zone(file, self.zone.as_ref())
            }
            None => records::load_zone(env.stdin(), self.zone.as_ref()),
        }
        .context("reading the signed zone")?;

        let (apex, _) = records::find_apex(&records, self.zone.as_ref())?;
        verify::verify_zone(&records, &apex, Timestamp::now())?;

        writeln!(
            env.stdout(),
            "zone {}: all signatures verify",
            apex.owner()
        );
        Ok(())
    }
}
