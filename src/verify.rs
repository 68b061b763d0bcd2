//! Checking a signed zone without the token.
//!
//! Verification is the signer run in reverse: the same eligibility walk,
//! the same to-be-signed image, but public-key operations only.

use bytes::Bytes;
use domain::base::iana::{Rtype, SecAlg};
use domain::base::name::ToName;
use domain::rdata::dnssec::{ProtoRrsig, Timestamp};
use domain::rdata::{Dnskey, Rrsig, ZoneRecordData};
use ring::signature::{self, RsaPublicKeyComponents};
use tracing::debug;

use crate::error::Error;
use crate::records::{Family, FamilyName, Rrset, SortedRecords, ZoneName};
use crate::sign::signed_data;

/// Check every signature in the zone.
///
/// Each RRset the signer would have covered must carry at least one RRSIG
/// that validates against a DNSKEY published at the apex and whose validity
/// window contains `now`.
pub fn verify_zone(
    records: &SortedRecords,
    apex: &FamilyName,
    now: Timestamp,
) -> Result<(), Error> {
    let dnskeys = apex_dnskeys(records, apex)?;

    // The owner name of a zone cut if we currently are at or below one.
    let mut cut: Option<FamilyName> = None;

    let mut families = records.families();
    families.skip_before(apex);

    for family in families {
        if !family.is_in_zone(apex) {
            break;
        }

        if let Some(ref cut) = cut {
            if family.owner().ends_with(cut.owner()) {
                continue;
            }
        }

        let at_cut = family.is_zone_cut(apex);
        cut = at_cut.then(|| family.family_name());

        for rrset in family.rrsets() {
            if rrset.rtype() == Rtype::RRSIG {
                continue;
            }
            if at_cut && rrset.rtype() != Rtype::DS {
                // Delegation NS and glue are unsigned by design.
                continue;
            }

            verify_rrset(&rrset, &family, apex, &dnskeys, now)?;
        }
    }

    Ok(())
}

/// Collect the DNSKEY RRset at the apex, keyed for signature lookup.
fn apex_dnskeys(
    records: &SortedRecords,
    apex: &FamilyName,
) -> Result<Vec<Dnskey<Bytes>>, Error> {
    let mut dnskeys = Vec::new();
    for record in records.iter() {
        if record.rtype() == Rtype::DNSKEY && record.owner().name_eq(apex.owner()) {
            if let ZoneRecordData::Dnskey(dnskey) = record.data() {
                dnskeys.push(dnskey.clone());
            }
        }
    }
    if dnskeys.is_empty() {
        return Err(Error::verification(format!(
            "no DNSKEY RRset at the zone apex {}",
            apex.owner()
        )));
    }
    Ok(dnskeys)
}

/// Check one RRset against the RRSIGs stored alongside it.
fn verify_rrset(
    rrset: &Rrset<'_>,
    family: &Family<'_>,
    apex: &FamilyName,
    dnskeys: &[Dnskey<Bytes>],
    now: Timestamp,
) -> Result<(), Error> {
    let covering: Vec<&Rrsig<Bytes, ZoneName>> = family
        .records()
        .filter_map(|record| match record.data() {
            ZoneRecordData::Rrsig(rrsig) if rrsig.type_covered() == rrset.rtype() => {
                Some(rrsig)
            }
            _ => None,
        })
        .collect();

    if covering.is_empty() {
        return Err(Error::verification(format!(
            "no RRSIG covering the {} RRset at {}",
            rrset.rtype(),
            rrset.owner()
        )));
    }

    let mut last_err = None;
    for rrsig in covering {
        match verify_one(rrset, rrsig, apex, dnskeys, now) {
            Ok(()) => {
                debug!(
                    "verified the {} RRset at {} against key tag {}",
                    rrset.rtype(),
                    rrset.owner(),
                    rrsig.key_tag()
                );
                return Ok(());
            }
            Err(err) => last_err = Some(err),
        }
    }
    // Not empty, so at least one error was recorded.
    Err(last_err.unwrap())
}

fn verify_one(
    rrset: &Rrset<'_>,
    rrsig: &Rrsig<Bytes, ZoneName>,
    apex: &FamilyName,
    dnskeys: &[Dnskey<Bytes>],
    now: Timestamp,
) -> Result<(), Error> {
    let fail = |reason: String| {
        Error::verification(format!(
            "the {} RRset at {} does not verify: {reason}",
            rrset.rtype(),
            rrset.owner()
        ))
    };

    if !rrsig.signer_name().name_eq(apex.owner()) {
        return Err(fail(format!("signed by foreign name {}", rrsig.signer_name())));
    }
    if now < rrsig.inception() {
        return Err(fail("signature not yet valid".into()));
    }
    if rrsig.expiration() < now {
        return Err(fail("signature expired".into()));
    }

    let dnskey = dnskeys
        .iter()
        .find(|dnskey| {
            dnskey.key_tag() == rrsig.key_tag() && dnskey.algorithm() == rrsig.algorithm()
        })
        .ok_or_else(|| {
            fail(format!(
                "no DNSKEY with tag {} and algorithm {} at the apex",
                rrsig.key_tag(),
                rrsig.algorithm()
            ))
        })?;

    let proto = ProtoRrsig::new(
        rrsig.type_covered(),
        rrsig.algorithm(),
        rrsig.labels(),
        rrsig.original_ttl(),
        rrsig.expiration(),
        rrsig.inception(),
        rrsig.key_tag(),
        rrsig.signer_name().clone(),
    );
    let message = signed_data(&proto, rrset, rrsig.original_ttl());

    verify_signature(dnskey, &message, rrsig.signature().as_ref())
        .map_err(|err| fail(err.to_string()))
}

/// Verify raw signature bytes against a DNSKEY's public key.
pub(crate) fn verify_signature(
    dnskey: &Dnskey<Bytes>,
    message: &[u8],
    sig: &[u8],
) -> Result<(), Error> {
    match dnskey.algorithm() {
        SecAlg::RSASHA256 => {
            let (e, n) = rsa_exponent_modulus(dnskey)?;
            RsaPublicKeyComponents { n, e }
                .verify(
                    &signature::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY,
                    message,
                    sig,
                )
                .map_err(|_| Error::verification("signature mismatch"))
        }
        other => Err(Error::verification(format!(
            "unsupported DNSKEY algorithm {other}"
        ))),
    }
}

/// Split an RFC 3110 RSA public key into exponent and modulus.
fn rsa_exponent_modulus(dnskey: &Dnskey<Bytes>) -> Result<(&[u8], &[u8]), Error> {
    let key = dnskey.public_key().as_ref();
    if key.len() <= 3 {
        return Err(Error::verification("RSA public key too short"));
    }

    let (pos, exponent_len) = if key[0] != 0 {
        (1, usize::from(key[0]))
    } else {
        (3, usize::from(u16::from_be_bytes([key[1], key[2]])))
    };
    let end = pos + exponent_len;
    if key.len() <= end {
        return Err(Error::verification("RSA public key too short"));
    }

    Ok((&key[pos..end], &key[end..]))
}

#[cfg(test)]
mod tests {
    use core::str::FromStr;

    use domain::base::iana::Class;
    use domain::base::{Record, Ttl};
    use domain::rdata::{Aaaa, ZoneRecordData};

    use super::*;
    use crate::denial::Nsec3Params;
    use crate::records::load_zone;
    use crate::sign::test_support::{fixed_salt, sign_test_zone, test_apex};

    const EXPIRATION: u32 = 2208988800; // 2040-01-01
    const INCEPTION: u32 = 1577836800; // 2020-01-01

    fn sign(nsec3: Option<Nsec3Params>) -> SortedRecords {
        sign_test_zone(
            Timestamp::from(EXPIRATION),
            Timestamp::from(INCEPTION),
            nsec3,
        )
    }

    #[test]
    fn round_trip_nsec() {
        let records = sign(None);
        verify_zone(&records, &test_apex(), Timestamp::now()).unwrap();
    }

    #[test]
    fn round_trip_nsec3() {
        let records = sign(Some(Nsec3Params::new(fixed_salt(), false)));
        verify_zone(&records, &test_apex(), Timestamp::now()).unwrap();
    }

    #[test]
    fn round_trip_nsec3_opt_out() {
        let records = sign(Some(Nsec3Params::new(fixed_salt(), true)));
        verify_zone(&records, &test_apex(), Timestamp::now()).unwrap();
    }

    #[test]
    fn round_trip_through_presentation_format() {
        // The rendered zone must parse back and still verify, like a
        // verifier reading the signer's output file.
        let records = sign(None);
        let mut rendered = String::new();
        records.write(&mut rendered).unwrap();

        let reread = load_zone(rendered.as_bytes(), None).unwrap();
        verify_zone(&reread, &test_apex(), Timestamp::now()).unwrap();
    }

    #[test]
    fn expired_zone_is_rejected() {
        let expiration = Timestamp::now().into_int().wrapping_sub(31_536_000);
        let inception = expiration.wrapping_sub(3600);
        let records = sign_test_zone(
            Timestamp::from(expiration),
            Timestamp::from(inception),
            None,
        );

        let err = verify_zone(&records, &test_apex(), Timestamp::now()).unwrap_err();
        assert!(err.to_string().contains("expired"), "got: {err}");
    }

    #[test]
    fn not_yet_valid_zone_is_rejected() {
        let inception = Timestamp::now().into_int().wrapping_add(3600);
        let expiration = inception.wrapping_add(31_536_000);
        let records = sign_test_zone(
            Timestamp::from(expiration),
            Timestamp::from(inception),
            None,
        );

        let err = verify_zone(&records, &test_apex(), Timestamp::now()).unwrap_err();
        assert!(err.to_string().contains("not yet valid"), "got: {err}");
    }

    #[test]
    fn tampered_record_is_rejected() {
        let mut records = sign(None);

        // Add a record the signer never saw.
        records.extend([Record::new(
            ZoneName::from_str("www.example.com").unwrap(),
            Class::IN,
            Ttl::from_secs(86400),
            ZoneRecordData::Aaaa(Aaaa::new("2001:db8::1".parse().unwrap())),
        )]);

        let err = verify_zone(&records, &test_apex(), Timestamp::now()).unwrap_err();
        assert!(err.to_string().contains("www.example.com"), "got: {err}");
    }

    #[test]
    fn missing_dnskey_is_rejected() {
        let records = sign(None);
        let stripped: SortedRecords = records
            .iter()
            .filter(|record| record.rtype() != Rtype::DNSKEY)
            .cloned()
            .collect();

        let err = verify_zone(&stripped, &test_apex(), Timestamp::now()).unwrap_err();
        assert!(err.to_string().contains("DNSKEY"), "got: {err}");
    }
}
