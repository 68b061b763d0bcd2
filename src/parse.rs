use core::str::FromStr;

use bytes::Bytes;
use domain::base::Name;
use domain::rdata::dnssec::Timestamp;
use domain::rdata::nsec3::Nsec3Salt;

use crate::error::Error;

pub fn parse_name(arg: &str) -> Result<Name<Bytes>, Error> {
    Name::from_str(&arg.to_lowercase()).map_err(|e| Error::usage(e))
}

/// Parse a signature timestamp.
///
/// Accepts an RFC 3339 date-time, a Unix timestamp, or the `YYYYMMDD[hhmmss]`
/// form used by the ldns tools.
pub fn parse_timestamp(arg: &str) -> Result<Timestamp, Error> {
    if let Ok(datetime) = chrono::DateTime::parse_from_rfc3339(arg) {
        let secs = datetime.timestamp();
        let secs = u32::try_from(secs)
            .map_err(|_| Error::usage(format!("timestamp '{arg}' out of range")))?;
        return Ok(Timestamp::from(secs));
    }

    // An eight digit number is a date, not a Unix timestamp. This makes
    // very old Unix timestamps unusable, which ldns-signzone accepts too.
    let res = if arg.len() == 8 && arg.parse::<u32>().is_ok() {
        Timestamp::from_str(&format!("{arg}000000"))
    } else {
        Timestamp::from_str(arg)
    };

    res.map_err(|err| Error::usage(format!("invalid timestamp '{arg}': {err}")))
}

/// Parse an NSEC3 salt given as lowercase hex.
pub fn parse_salt(arg: &str) -> Result<Nsec3Salt<Bytes>, Error> {
    if arg.len() >= 512 {
        Err(Error::usage("salt too long"))
    } else {
        Nsec3Salt::from_str(arg).map_err(|err| Error::usage(err))
    }
}
