//! Authenticated denial of existence: NSEC and NSEC3 chains.

use bytes::Bytes;
use domain::base::iana::{Class, Nsec3HashAlg, Rtype};
use domain::base::name::{NameBuilder, ToName};
use domain::base::{Record, Ttl};
use domain::rdata::dnssec::RtypeBitmap;
use domain::rdata::nsec3::{Nsec3Salt, OwnerHash};
use domain::rdata::{Nsec, Nsec3, Nsec3param, ZoneRecordData};
use domain::utils::base32;
use ring::digest;
use ring::rand::SecureRandom;

use crate::error::Error;
use crate::records::{FamilyName, SortedRecords, ZoneName, ZoneRecord};

/// The number of extra hash iterations applied to NSEC3 owner names.
pub const NSEC3_ITERATIONS: u16 = 10;

/// The number of random octets in a generated NSEC3 salt.
const SALT_LEN: usize = 4;

//------------ Nsec3Params ---------------------------------------------------

/// The parameters of an NSEC3 chain.
#[derive(Clone)]
pub struct Nsec3Params {
    pub algorithm: Nsec3HashAlg,
    pub iterations: u16,
    pub salt: Nsec3Salt<Bytes>,
    pub opt_out: bool,
}

impl Nsec3Params {
    /// SHA-1 with the fixed iteration count and the given salt.
    pub fn new(salt: Nsec3Salt<Bytes>, opt_out: bool) -> Self {
        Nsec3Params {
            algorithm: Nsec3HashAlg::SHA1,
            iterations: NSEC3_ITERATIONS,
            salt,
            opt_out,
        }
    }

    fn flags(&self) -> u8 {
        if self.opt_out {
            0b0000_0001
        } else {
            0
        }
    }
}

/// Generate a fresh random NSEC3 salt.
pub fn generate_salt(rng: &dyn SecureRandom) -> Result<Nsec3Salt<Bytes>, Error> {
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| Error::io("cannot gather randomness for the NSEC3 salt"))?;
    Ok(Nsec3Salt::from_octets(Bytes::copy_from_slice(&salt)).expect("short salt"))
}

//------------ Nsec3Records --------------------------------------------------

/// The records that make up an NSEC3 chain.
pub struct Nsec3Records {
    /// The NSEC3 records, in hash order.
    pub recs: Vec<ZoneRecord>,

    /// The NSEC3PARAM record at the apex.
    pub param: ZoneRecord,
}

//------------ NSEC chain ----------------------------------------------------

/// Generate the NSEC chain for the zone.
///
/// Every name holding authoritative data gets an NSEC record pointing at the
/// next such name in canonical order, wrapping back around to the apex.
/// Delegation points and everything below them stay out of the chain.
pub fn nsecs(records: &SortedRecords, apex: &FamilyName, ttl: Ttl) -> Vec<ZoneRecord> {
    let mut res = Vec::new();

    // The owner name of a zone cut if we currently are at or below one.
    let mut cut: Option<FamilyName> = None;

    let mut families = records.families();
    families.skip_before(apex);

    // Because each NSEC points at the following name, the record for one
    // family can only be built once the next eligible family is known.
    let mut prev: Option<(FamilyName, RtypeBitmap<Bytes>)> = None;

    // The apex name closes the chain.
    let apex_owner = families.first_owner().clone();

    for family in families {
        if !family.is_in_zone(apex) {
            break;
        }

        if let Some(ref cut) = cut {
            if family.owner().ends_with(cut.owner()) {
                continue;
            }
        }

        let name = family.family_name();

        if family.is_zone_cut(apex) {
            // Delegations are left unsigned and carry no NSEC record; the
            // names below them belong to the child zone.
            cut = Some(name);
            continue;
        }
        cut = None;

        if let Some((prev_name, bitmap)) = prev.take() {
            res.push(prev_name.into_record(
                ttl,
                ZoneRecordData::Nsec(Nsec::new(family.owner().clone(), bitmap)),
            ));
        }

        let mut bitmap = RtypeBitmap::<Bytes>::builder();
        // RFC 4035 section 2.3: the bitmap must cover the NSEC record
        // itself and its RRSIG.
        bitmap.add(Rtype::RRSIG).unwrap();
        bitmap.add(Rtype::NSEC).unwrap();
        for rrset in family.rrsets() {
            bitmap.add(rrset.rtype()).unwrap();
        }

        prev = Some((name, bitmap.finalize()));
    }

    if let Some((prev_name, bitmap)) = prev {
        res.push(prev_name.into_record(
            ttl,
            ZoneRecordData::Nsec(Nsec::new(apex_owner, bitmap)),
        ));
    }
    res
}

//------------ NSEC3 chain ---------------------------------------------------

/// Generate the NSEC3 chain and NSEC3PARAM record for the zone.
///
/// Hashing is deterministic, so the chain is built in a single pass: hash
/// every eligible owner, sort by hash, and let each record point at the
/// next. A collision between distinct owner names is reported as an error
/// rather than silently dropping a name.
pub fn nsec3s(
    records: &SortedRecords,
    apex: &FamilyName,
    ttl: Ttl,
    params: &Nsec3Params,
) -> Result<Nsec3Records, Error> {
    let mut hashed: Vec<(Vec<u8>, ZoneName, RtypeBitmap<Bytes>)> = Vec::new();

    // The owner name of a zone cut if we currently are at or below one.
    let mut cut: Option<FamilyName> = None;

    let mut families = records.families();
    families.skip_before(apex);

    let apex_owner = families.first_owner().clone();

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

        let has_ds = family
            .records()
            .any(|record| record.rtype() == Rtype::DS);

        // RFC 5155 section 7.1: under opt-out, unsigned delegations are
        // left out of the chain.
        if at_cut && params.opt_out && !has_ds {
            continue;
        }

        let mut bitmap = RtypeBitmap::<Bytes>::builder();
        if at_cut {
            // At a delegation only the delegation itself (and a secure
            // entry point, if any) is visible; glue is not.
            bitmap.add(Rtype::NS).unwrap();
            if has_ds {
                bitmap.add(Rtype::DS).unwrap();
                bitmap.add(Rtype::RRSIG).unwrap();
            }
        } else {
            bitmap.add(Rtype::RRSIG).unwrap();
            for rrset in family.rrsets() {
                bitmap.add(rrset.rtype()).unwrap();
            }
            if family.owner().name_eq(&apex_owner) {
                bitmap.add(Rtype::NSEC3PARAM).unwrap();
            }
        }

        let hash = nsec3_hash(
            family.owner(),
            params.algorithm,
            params.iterations,
            &params.salt,
        )?;

        hashed.push((hash, family.owner().clone(), bitmap.finalize()));
    }

    hashed.sort_by(|a, b| a.0.cmp(&b.0));
    for window in hashed.windows(2) {
        if window[0].0 == window[1].0 {
            return Err(Error::parse(format!(
                "NSEC3 hash collision between {} and {}",
                window[0].1, window[1].1
            )));
        }
    }

    let mut recs = Vec::with_capacity(hashed.len());
    for (i, (hash, owner, bitmap)) in hashed.iter().enumerate() {
        let next = &hashed[(i + 1) % hashed.len()].0;
        let next_owner = OwnerHash::from_octets(Bytes::copy_from_slice(next))
            .map_err(|err| Error::parse(format!("invalid NSEC3 hash for {owner}: {err}")))?;

        let nsec3 = Nsec3::new(
            params.algorithm,
            params.flags(),
            params.iterations,
            params.salt.clone(),
            next_owner,
            bitmap.clone(),
        );

        recs.push(Record::new(
            hashed_owner_name(hash, apex)?,
            Class::IN,
            ttl,
            ZoneRecordData::Nsec3(nsec3),
        ));
    }

    // RFC 5155 section 4.1.2: the NSEC3PARAM flags field is always zero,
    // even when the chain itself uses opt-out.
    let param = Record::new(
        apex.owner().clone(),
        Class::IN,
        ttl,
        ZoneRecordData::Nsec3param(Nsec3param::new(
            params.algorithm,
            0,
            params.iterations,
            params.salt.clone(),
        )),
    );

    Ok(Nsec3Records { recs, param })
}

/// The RFC 5155 iterated hash of an owner name.
///
/// `H(x) = SHA-1(x || salt)`, applied once to the canonical wire form of
/// the name and then `iterations` more times to its own output.
fn nsec3_hash(
    owner: &ZoneName,
    algorithm: Nsec3HashAlg,
    iterations: u16,
    salt: &Nsec3Salt<Bytes>,
) -> Result<Vec<u8>, Error> {
    if algorithm != Nsec3HashAlg::SHA1 {
        return Err(Error::usage(format!(
            "unsupported NSEC3 hash algorithm {algorithm}"
        )));
    }

    let mut buf = Vec::new();
    owner.compose_canonical(&mut buf).unwrap();
    buf.extend_from_slice(salt.as_slice());

    let mut hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &buf);
    for _ in 0..iterations {
        let mut next = hash.as_ref().to_vec();
        next.extend_from_slice(salt.as_slice());
        hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &next);
    }

    Ok(hash.as_ref().to_vec())
}

/// Build `base32hex(hash).apex` as the owner of an NSEC3 record.
fn hashed_owner_name(hash: &[u8], apex: &FamilyName) -> Result<ZoneName, Error> {
    let label = base32::encode_string_hex(hash).to_ascii_lowercase();
    let mut builder = NameBuilder::new_bytes();
    builder
        .append_chars(label.chars())
        .map_err(|err| Error::parse(format!("invalid NSEC3 owner label: {err}")))?;
    builder
        .append_origin(apex.owner())
        .map_err(|err| Error::parse(format!("invalid NSEC3 owner name: {err}")))
}
