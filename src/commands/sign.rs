use std::fs::File;
use std::path::PathBuf;

use bytes::Bytes;
use clap::builder::ValueParser;
use domain::base::Name;
use domain::rdata::dnssec::Timestamp;
use domain::rdata::nsec3::Nsec3Salt;
use ring::rand::SystemRandom;
use tracing::info;

use crate::denial::{self, Nsec3Params};
use crate::env::Env;
use crate::error::{Context, Error};
use crate::hsm::{KeyRing, Session};
use crate::records;
use crate::{parse, sign};

/// Signatures made without an explicit expiration live for one year.
const ONE_YEAR: u32 = 31_536_000;

//------------ Sign ----------------------------------------------------------

#[derive(Clone, Debug, clap::Args)]
pub struct Sign {
    /// Create keys in the token if the label holds none
    #[arg(short = 'c', default_value_t = false)]
    create_keys: bool,

    /// Signature expiration date [default: one year from now]
    ///
    /// A date can be an RFC 3339 date-time, a Unix timestamp, or of the
    /// form <YYYYMMdd[hhmmss]>.
    #[arg(
        short = 'e',
        value_name = "date",
        value_parser = ValueParser::new(Sign::parse_timestamp_arg),
    )]
    expiration: Option<Timestamp>,

    /// The zone file to sign [default: stdin]
    #[arg(short = 'f', value_name = "file")]
    zonefile: Option<PathBuf>,

    /// Label of the signing keys in the token
    #[arg(short = 'l', value_name = "label", default_value = "dHSM-signer")]
    label: String,

    /// Use NSEC3 instead of NSEC
    #[arg(short = '3', default_value_t = false)]
    nsec3: bool,

    /// Set the NSEC3 opt-out flag and skip unsigned delegations
    #[arg(short = 'o', default_value_t = false, requires = "nsec3")]
    opt_out: bool,

    /// Path of the PKCS#11 module of the token
    #[arg(short = 'p', value_name = "library")]
    module: PathBuf,

    /// User PIN of the token
    #[arg(short = 'k', value_name = "pin", default_value = "1234")]
    pin: String,

    /// Apex of the zone to sign
    #[arg(
        short = 'z',
        value_name = "zone",
        value_parser = ValueParser::new(Sign::parse_name_arg),
    )]
    zone: Name<Bytes>,

    /// Write the signed zone to this file [default: stdout]
    #[arg(short = 'O', value_name = "file")]
    out_file: Option<PathBuf>,

    /// Signature inception date [default: now]
    #[arg(
        long = "inception",
        value_name = "date",
        value_parser = ValueParser::new(Sign::parse_timestamp_arg),
    )]
    inception: Option<Timestamp>,

    /// Fixed NSEC3 salt in hex [default: 4 random octets]
    #[arg(
        long = "salt",
        value_name = "hex",
        requires = "nsec3",
        value_parser = ValueParser::new(Sign::parse_salt_arg),
    )]
    salt: Option<Nsec3Salt<Bytes>>,

    /// Amount added to the SOA serial of the signed zone
    #[arg(long = "serial-increment", value_name = "number", default_value_t = 2)]
    serial_increment: u32,
}

impl Sign {
    fn parse_timestamp_arg(arg: &str) -> Result<Timestamp, clap::Error> {
        parse::parse_timestamp(arg)
            .map_err(|err| clap::Error::raw(clap::error::ErrorKind::InvalidValue, err))
    }

    fn parse_name_arg(arg: &str) -> Result<Name<Bytes>, clap::Error> {
        parse::parse_name(arg)
            .map_err(|err| clap::Error::raw(clap::error::ErrorKind::InvalidValue, err))
    }

    fn parse_salt_arg(arg: &str) -> Result<Nsec3Salt<Bytes>, clap::Error> {
        parse::parse_salt(arg)
            .map_err(|err| clap::Error::raw(clap::error::ErrorKind::InvalidValue, err))
    }

    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let inception = self.inception.unwrap_or_else(Timestamp::now);
        let expiration = self
            .expiration
            .unwrap_or_else(|| Timestamp::from(inception.into_int().wrapping_add(ONE_YEAR)));

        // Keys first: there is no point in reading the zone if the token
        // is unreachable.
        let session = Session::open(&env.in_cwd(&self.module), &self.pin)?;
        let keyring = KeyRing::new(&session, &self.label);
        let (ksk, zsk) = match keyring.find(&self.zone)? {
            Some(keys) => keys,
            None if self.create_keys => keyring.create(&self.zone)?,
            None => {
                return Err(Error::hsm(format!(
                    "no keys under label '{}'; pass -c to create them",
                    self.label
                )))
            }
        };
        info!(
            "signing {} with key tags {} (KSK) and {} (ZSK)",
            self.zone,
            ksk.key_tag(),
            zsk.key_tag()
        );

        // Read and check the zone.
        let mut records = match &self.zonefile {
            Some(path) => {
                let file = File::open(env.in_cwd(path)).map_err(|err| {
                    Error::io(format!("cannot open '{}': {err}", path.display()))
                })?;
                records::load_zone(file, Some(&self.zone))
            }
            None => records::load_zone(env.stdin(), Some(&self.zone)),
        }
        .context("reading the zone")?;

        let (apex, denial_ttl) = records::find_apex(&records, Some(&self.zone))?;
        records.bump_soa_serial(self.serial_increment)?;

        // Publish the keys at the apex.
        let dnskey_ttl = records
            .find_soa()
            .map(|soa| soa.ttl())
            .unwrap_or(denial_ttl);
        let _ = records.insert(ksk.dnskey_record(&apex, dnskey_ttl));
        let _ = records.insert(zsk.dnskey_record(&apex, dnskey_ttl));

        // Build the denial chain.
        if self.nsec3 {
            let salt = match self.salt.clone() {
                Some(salt) => salt,
                None => denial::generate_salt(&SystemRandom::new())?,
            };
            let params = Nsec3Params::new(salt, self.opt_out);
            let chain = denial::nsec3s(&records, &apex, denial_ttl, &params)?;
            records.extend(chain.recs);
            let _ = records.insert(chain.param);
        } else {
            let nsecs = denial::nsecs(&records, &apex, denial_ttl);
            records.extend(nsecs);
        }

        // Sign. A single failed signature aborts the whole run.
        let rrsigs = sign::sign_zone(&records, &apex, expiration, inception, &ksk, &zsk)?;
        let count = rrsigs.len();
        records.extend(rrsigs);

        // Render into memory; the output is only written once the zone is
        // completely signed.
        let mut out = String::new();
        records.write(&mut out)?;
        match &self.out_file {
            Some(path) => {
                std::fs::write(env.in_cwd(path), out.as_bytes()).map_err(|err| {
                    Error::io(format!("cannot write '{}': {err}", path.display()))
                })?;
            }
            None => {
                let mut stdout = env.stdout();
                write!(stdout, "{out}");
            }
        }

        info!("signed {count} RRsets in zone {}", self.zone);
        Ok(())
    }
}
