//! Signing RRsets.
//!
//! The cryptographic half of an RRSIG is produced behind the [`SignRaw`]
//! seam: in production that is a private key that never leaves the PKCS#11
//! token, in tests an in-memory RSA key. Everything else -- the RRSIG
//! skeleton, the canonical to-be-signed image, key selection -- lives here.

use bytes::Bytes;
use domain::base::iana::{Rtype, SecAlg};
use domain::base::name::ToName;
use domain::base::{Record, Ttl};
use domain::rdata::dnssec::{ProtoRrsig, Timestamp};
use domain::rdata::{Dnskey, ZoneRecordData};
use tracing::debug;

use crate::error::{Context, Error};
use crate::records::{
    compose_canonical_with_ttl, FamilyName, Rrset, SortedRecords, ZoneName, ZoneRecord,
};
use crate::verify;

//------------ SignRaw -------------------------------------------------------

/// A signing operation over a raw byte buffer.
///
/// Implementations hash and sign the buffer in one step with whatever holds
/// the private key; the returned signature bytes are attached to the RRSIG
/// verbatim.
pub trait SignRaw {
    /// The DNSSEC algorithm the signatures are made with.
    fn algorithm(&self) -> SecAlg;

    /// Sign the given data.
    fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

//------------ SigningKey ----------------------------------------------------

/// A key pair bound to its public DNSKEY form.
pub struct SigningKey<K> {
    owner: ZoneName,
    flags: u16,
    dnskey: Dnskey<Bytes>,
    key: K,
}

impl<K: SignRaw> SigningKey<K> {
    /// Bundle a raw signer with its DNSKEY identity.
    ///
    /// `public_key` is the algorithm-specific wire form of the public key
    /// (for RSA, RFC 3110: length-prefixed exponent followed by the
    /// modulus).
    pub fn new(owner: ZoneName, flags: u16, public_key: Bytes, key: K) -> Result<Self, Error> {
        let dnskey = Dnskey::new(flags, 3, key.algorithm(), public_key)
            .map_err(|err| Error::hsm(format!("cannot build DNSKEY record: {err}")))?;
        Ok(SigningKey {
            owner,
            flags,
            dnskey,
            key,
        })
    }

    pub fn owner(&self) -> &ZoneName {
        &self.owner
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn algorithm(&self) -> SecAlg {
        self.key.algorithm()
    }

    pub fn dnskey(&self) -> &Dnskey<Bytes> {
        &self.dnskey
    }

    pub fn key_tag(&self) -> u16 {
        self.dnskey.key_tag()
    }

    pub fn is_secure_entry_point(&self) -> bool {
        self.dnskey.is_secure_entry_point()
    }

    pub fn is_zone_signing_key(&self) -> bool {
        self.dnskey.is_zone_key()
    }

    /// The DNSKEY record to publish at the apex.
    pub fn dnskey_record(&self, apex: &FamilyName, ttl: Ttl) -> ZoneRecord {
        Record::new(
            apex.owner().clone(),
            apex.class(),
            ttl,
            ZoneRecordData::Dnskey(self.dnskey.clone()),
        )
    }
}

//------------ Zone signing --------------------------------------------------

/// Sign every RRset of the zone that must carry a signature.
///
/// The DNSKEY RRset is signed with the key signing key, everything else
/// with the zone signing key. NS RRsets at delegation points, glue, and
/// anything below a delegation stay unsigned; a DS RRset at a delegation
/// is signed. Returns the RRSIG records to add to the zone.
///
/// The walk is deterministic: with fixed inception, expiration and NSEC3
/// salt, repeated runs produce identical output.
pub fn sign_zone<K: SignRaw>(
    records: &SortedRecords,
    apex: &FamilyName,
    expiration: Timestamp,
    inception: Timestamp,
    ksk: &SigningKey<K>,
    zsk: &SigningKey<K>,
) -> Result<Vec<ZoneRecord>, Error> {
    let mut res: Vec<ZoneRecord> = Vec::new();

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
            if at_cut {
                // At a delegation, NS and glue belong to the child zone.
                // Only a secure entry point is ours to sign.
                if rrset.rtype() != Rtype::DS {
                    continue;
                }
            } else if rrset.rtype() == Rtype::RRSIG {
                continue;
            }

            let key = if rrset.rtype() == Rtype::DNSKEY {
                ksk
            } else {
                zsk
            };

            debug!(
                "signing {} RRset at {} with key tag {}",
                rrset.rtype(),
                rrset.owner(),
                key.key_tag()
            );
            let rrsig =
                sign_rrset(&rrset, apex, expiration, inception, key).with_context(|| {
                    format!("signing the {} RRset at {}", rrset.rtype(), rrset.owner())
                })?;
            res.push(rrsig);
        }
    }

    Ok(res)
}

/// Produce the RRSIG record covering a single RRset.
pub fn sign_rrset<K: SignRaw>(
    rrset: &Rrset<'_>,
    apex: &FamilyName,
    expiration: Timestamp,
    inception: Timestamp,
    key: &SigningKey<K>,
) -> Result<ZoneRecord, Error> {
    let rrsig = ProtoRrsig::new(
        rrset.rtype(),
        key.algorithm(),
        rrset.owner().rrsig_label_count(),
        rrset.ttl(),
        expiration,
        inception,
        key.key_tag(),
        apex.owner().clone(),
    );

    let data = signed_data(&rrsig, rrset, rrset.ttl());
    let signature = key.key.sign_raw(&data)?;

    // Catch a misbehaving token before an invalid signature ends up in the
    // zone.
    verify::verify_signature(key.dnskey(), &data, &signature).map_err(|_| {
        Error::hsm(format!(
            "the token produced a signature that does not verify against key tag {}",
            key.key_tag()
        ))
    })?;

    let rrsig = rrsig
        .into_rrsig(Bytes::from(signature))
        .map_err(|err| Error::hsm(format!("signature does not fit a record: {err}")))?;
    Ok(Record::new(
        rrset.owner().clone(),
        rrset.class(),
        rrset.ttl(),
        ZoneRecordData::Rrsig(rrsig),
    ))
}

/// The canonical to-be-signed image for an RRset.
///
/// RFC 4034 section 3.1.8.1: the RRSIG RDATA with the signature left out,
/// followed by each member record in canonical form with the original TTL
/// substituted, in canonical RDATA order. The records of an [`Rrset`] are
/// already canonically sorted.
pub fn signed_data(
    rrsig: &ProtoRrsig<ZoneName>,
    rrset: &Rrset<'_>,
    original_ttl: Ttl,
) -> Vec<u8> {
    let mut buf = Vec::new();
    rrsig.compose_canonical(&mut buf).unwrap();
    for record in rrset.iter() {
        compose_canonical_with_ttl(record, original_ttl, &mut buf);
    }
    buf
}

//------------ Test keys -----------------------------------------------------

/// Fixed RSA key pairs for exercising the signing paths without a token.
#[cfg(test)]
pub(crate) mod test_support {
    use core::str::FromStr;

    use domain::base::iana::Class;
    use domain::rdata::nsec3::Nsec3Salt;
    use domain::utils::{base16, base64};
    use ring::rand::SystemRandom;
    use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};

    use super::*;
    use crate::denial::{self, Nsec3Params};
    use crate::records::{find_apex, load_zone};

    /// The nine record zone used throughout the signing tests.
    pub const TEST_ZONE: &str = concat!(
        "example.com. 86400 IN SOA ns1.example.com. hostmaster.example.com. ",
        "2019052103 10800 15 604800 10800\n",
        "delegate.example.com. 86400 IN NS other.domain.com.\n",
        "delegate.example.com. 86400 IN A 127.0.0.4\n",
        "example.com. 86400 IN NS ns1.example.com.\n",
        "example.com. 86400 IN MX 10 localhost.\n",
        "ftp.example.com. 86400 IN CNAME www.example.com.\n",
        "ns1.example.com. 86400 IN A 127.0.0.1\n",
        "www.example.com. 86400 IN A 127.0.0.2\n",
        "yo.example.com. 86400 IN A 127.0.0.3\n",
    );

    /// An in-memory RSA-SHA256 signer.
    pub struct MemoryKey {
        key_pair: RsaKeyPair,
    }

    impl MemoryKey {
        fn from_pkcs8(pem_b64: &str) -> Self {
            let der: Vec<u8> = base64::decode(&pem_b64.replace('\n', "")).unwrap();
            MemoryKey {
                key_pair: RsaKeyPair::from_pkcs8(&der).unwrap(),
            }
        }
    }

    impl SignRaw for MemoryKey {
        fn algorithm(&self) -> SecAlg {
            SecAlg::RSASHA256
        }

        fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
            let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
            self.key_pair
                .sign(&RSA_PKCS1_SHA256, &SystemRandom::new(), data, &mut signature)
                .map_err(|_| Error::hsm("test key refused to sign"))?;
            Ok(signature)
        }
    }

    /// Assemble the RFC 3110 public key wire form for e = 65537.
    fn rfc3110_public_key(modulus_hex: &str) -> Bytes {
        let modulus = base16::decode_vec(modulus_hex).unwrap();
        let mut key = vec![3u8, 0x01, 0x00, 0x01];
        key.extend_from_slice(&modulus);
        Bytes::from(key)
    }

    pub fn test_keys(owner: &str) -> (SigningKey<MemoryKey>, SigningKey<MemoryKey>) {
        let owner = ZoneName::from_str(owner).unwrap();
        let ksk = SigningKey::new(
            owner.clone(),
            257,
            rfc3110_public_key(KSK_MODULUS_HEX),
            MemoryKey::from_pkcs8(KSK_PKCS8_B64),
        )
        .unwrap();
        let zsk = SigningKey::new(
            owner,
            256,
            rfc3110_public_key(ZSK_MODULUS_HEX),
            MemoryKey::from_pkcs8(ZSK_PKCS8_B64),
        )
        .unwrap();
        (ksk, zsk)
    }

    /// Run the whole signing pipeline over [`TEST_ZONE`].
    pub fn sign_test_zone(
        expiration: Timestamp,
        inception: Timestamp,
        nsec3: Option<Nsec3Params>,
    ) -> SortedRecords {
        let mut records = load_zone(TEST_ZONE.as_bytes(), None).unwrap();
        let (apex, ttl) = find_apex(&records, None).unwrap();
        let (ksk, zsk) = test_keys("example.com");

        let apex_ttl = records.find_soa().unwrap().ttl();
        let _ = records.insert(ksk.dnskey_record(&apex, apex_ttl));
        let _ = records.insert(zsk.dnskey_record(&apex, apex_ttl));

        match nsec3 {
            Some(params) => {
                let chain = denial::nsec3s(&records, &apex, ttl, &params).unwrap();
                records.extend(chain.recs);
                let _ = records.insert(chain.param);
            }
            None => {
                let nsecs = denial::nsecs(&records, &apex, ttl);
                records.extend(nsecs);
            }
        }

        let rrsigs = sign_zone(&records, &apex, expiration, inception, &ksk, &zsk).unwrap();
        records.extend(rrsigs);
        records
    }

    pub fn fixed_salt() -> Nsec3Salt<Bytes> {
        Nsec3Salt::from_octets(Bytes::from_static(&[0xca, 0xfe, 0xba, 0xbe])).unwrap()
    }

    pub fn test_apex() -> FamilyName {
        FamilyName::new(ZoneName::from_str("example.com").unwrap(), Class::IN)
    }

    const KSK_PKCS8_B64: &str = "\
MIIEvgIBADANBgkqhkiG9w0BAQEFAASCBKgwggSkAgEAAoIBAQDAo7Ym/spwHCvX\
fop64JENZLiCMIwypJCzQOJGWxGy/Uav8WCvEWMidPWpeFji7ZPL4rRcNHay9H5q\
Ye1BChJFDWVgJEsNqDza8i+JEiCpEbLtDHoRHQCEgc3vmBlz5thuDLa79ObnuQBi\
KPeSCHdz4mOqkgtCBe6PvsctQdyue1jrbUYOgc7ZK/cKkZKeWAKuccWpUpAIlQi8\
xzOWtim8hshvOqqqbvSJcZZwbTiGL4llkoqEDl9AZ98IUB7QwYbD8gV9xrFE3Cbb\
2oRraj4dejs1y8ccidjcLpvQaSnwb+67GTJCce17liXxRgGbQE/RgRAK2cpBm3rb\
Fl7O5ivvAgMBAAECggEALQGyq26ovkOerJSoZufzi7UF9IjCIIzZL8APfY+GVZKe\
Aro6s/w0dJbt1D/FSJNoDeDz8XziZJIBvPoPE7x2I0LrdehUzqaJPUALAhPFpKp5\
aq+ZD0l+1vZ6tikLfUwoMaHvyX8AuY+7+rMGkExBGEaCsZW4Yp7/Kv9QCo9SL0ND\
cSC8XMetSG3lJvCbjkjX0g+HAuOIEo5nmWlCgXKitPwa0y6te7V4OtEHC2ABSw1Z\
d5GUtsjaAd3+Y8jGHP99OuetvKLUhIGoYFgXeow8CAlz8Yfq9mpUGvBmCIRP/3P4\
83tS37L39NqiB3adGzG1vwZgPwDURWPxE0qntU2f/QKBgQDeUBgYYFseBrVvp0j3\
ouKrQTQ13sVtGp2ylLeKSku52yThqKBku0a0qinlZYbxGHLKEVuIjF4gqiCnnytL\
I9iY2/41VGVxACVmvEfzQ6SWuseyMNX0iQtr6km+uy7l9utitEoEq9uGLTJMHlcr\
tuWOdO0uaM1h+MGaQLfAGp9bowKBgQDd1IkPIA1CZYyp//c3E7Hly2YOFULxyiMB\
UzVF7ESmAfSAOOFNk6+T7KsEDmsLoWxRbu6IT4XlxyhSrO4fXCDLKAxHmaZiKVdX\
xM+89UAsN5QDob2twRunryqkigP+cT8N3MFYWzG7qs4r/50CYr1vP5nNzCFNVmYN\
yrOjbZszRQKBgQCXWF+O+MoPPvH1+SSrsbAudk1c/zPYeu4wzR3Gf53eAVqyZWIM\
MZKJG+85xEyBhetftUFjTGwoQKnKc4m9tcGXDu2Y0MPekgLkVfmFmt9J3g5lOOnv\
d/zWksFxn2zmEZtdru9VDsp8Jfi/6Ufe8ryEpwVxOtfXgsoKgVSW64jhkQKBgQCE\
aQvSwnAHtPPsuYQIFTJ4Fxv4xgoqp1yTuuYusaQcb0hRjSI3GzOPmZJPHogY7ibo\
yM2LAeTLzkAscVrFz0kn2uTRjE57g2/GTQ0vHjlK63XnYREGeSEXy4AprNRLea+I\
h7/FDNI30fG046QFu4iVsiINbI5oSm0qSFdH8vHT/QKBgCmUGqCLINC3DMHalHwY\
4ozkc/TQ4do/PdWkFU5yszZmGs0P0fDDxIqvNOJ7Lqd315Wrbv9CK7crFIHZuinq\
EcPDhuzg/Lmmj0ocKkuVigtt2ztgIItDi1M2ZM2cqYfKx3SgUI1uB6sLCeR2ZCRa\
fNMwQdnsiI3T4opmNK95SGnY";

    const KSK_MODULUS_HEX: &str = "\
C0A3B626FECA701C2BD77E8A7AE0910D64B882308C32A490B340E2465B11B2FD\
46AFF160AF11632274F5A97858E2ED93CBE2B45C3476B2F47E6A61ED410A1245\
0D6560244B0DA83CDAF22F891220A911B2ED0C7A111D008481CDEF981973E6D8\
6E0CB6BBF4E6E7B9006228F792087773E263AA920B4205EE8FBEC72D41DCAE7B\
58EB6D460E81CED92BF70A91929E5802AE71C5A95290089508BCC73396B629BC\
86C86F3AAAAA6EF4897196706D38862F8965928A840E5F4067DF08501ED0C186\
C3F2057DC6B144DC26DBDA846B6A3E1D7A3B35CBC71C89D8DC2E9BD06929F06F\
EEBB19324271ED7B9625F146019B404FD181100AD9CA419B7ADB165ECEE62BEF";

    const ZSK_PKCS8_B64: &str = "\
MIIEvAIBADANBgkqhkiG9w0BAQEFAASCBKYwggSiAgEAAoIBAQC4gBXoIOm/fxVh\
KXzIKnFKXJIqYuhYTYr6Iu0vmQ/RSCutZsIvbfRn+gW/mU8fcuYQlTBlifujm+1c\
E0ObJxerG/t/ecQ75SmiYQggGaNEMqiS1fyTdHPXCPwtFPcq7lEHdrSB/DgVu7XS\
KisUEUy0jpSW7pVTcwDLfBzs6VCRocOMjkVWthmEqnBHd2welmJDWCWHzMYphi6C\
igJIcuMQix1UjaiGCylRHuusTLwb9GF+jPew/yUaXfGVn3ydWFWQY3bNPlOZ1Ja5\
AJfz9DYbKu0+Tx8KPM3buaWT417fqNClsTTEqBNb0robpTEOp/YGssHnTw7QI5Qg\
84nOvxjhAgMBAAECggEAAcqx1m+qWs7xt/fvybhOK51kM0MkmmXlpaTeHZkOCM60\
axIBF2fTuKUUfm8PS3NRmP9x6dwDNcZsKpFJZo2588QH7uybDOqGzkL9rkQNU4Gd\
eh6MAHV8rKkb4bLw41dPHtkVcPzpNGDUBqzL+ldNe90eGU2qCy4cknBKoQeiqbql\
t0JZVv9VJy1KWW/3kAnK0wCs5fF7RWTj/9QG+bztvY97J6hZDoGdU/Yxsi/8q6dP\
+9yHJJEYnXvDZFnMBfQMx/0EnCGNX0oj7lfG5fdaYH7FOhHsA7UkGAn43BpDOqRy\
3a5RDvPDFsUzxwQAbEUS9hsl2iTSBsTWUR2bRf1u/wKBgQDngq2CzEeeCwXAkZ5D\
J/eRjlgoX+k7yYteo0AdlybCiUVIud/u9USNb7ntexsqzjwyOOTQDqsb0LqQwoDq\
Z7XxKzUWdUDyc+QVRmdd6kPV30vi92a5eUvAsbOHhUyJ+1J4IxltnopNAU4MEtZ/\
3rhl/QzqhsjPMZQrp2kcRWz6gwKBgQDMBF6nMwFeBQlKhtUOS5t7Qe8/RCy7vfAi\
6Qc0CEh4lRUr9RppAh5xLUlcwTZvvk3WmAxZ7vejVjkZldp3pOEPPDZ8TibrOfaw\
SJglgEu4Km1Qvr19IEWEIobD5EqpxeuYzmP++sNqHqnhkqSJG+hkvb18KebTRCyq\
RaetqNtRywKBgDW0b9HO17JG9k+kuCT2CY0/ix3amf1flLAgiMgUf05Tj7n+PH9v\
cDarO2Nm0neMnhQ8dH/7VyA9vHnGVSeLZX6LumX6T1WvIrL4wRPdO11KzozZPYA7\
LiKGVpJSjt3XalsqMUTnqUeRzOwqFo5VOUuXdz6Ug9Lkum2iCVUgmdZHAoGAMNvP\
Cz200x5jpjx6I61JtBALStx51hBbxRCHkBd3u6EAbAGL7J/8SGBvFE6VSdeKbp0F\
QDhxh+VrUUxJAKQ03eAusEBLI8RC5t7LyRdbiuRmP5MecCvdWhKmsZ0noFbs4DB1\
VCgbyntDdekXjFppok6qZWTniarnA3Qg/v7UX1cCgYBBHe4cNYdCuFQvSmkHFQU7\
2+q7fAmmJB6KFzyAADaHkX4eikg6ZVxTDX/LOhhZxe90Rcqr34T24dlysQob2Kum\
pzL+yBxA5SVDLtTVoeMcIRhbRF0BM3dfnI6Pzf2S1DDT+v4dGhoVI2Ymf/VmVZh2\
dp7Bq3X/nSonhHcBnXIo+Q==";

    const ZSK_MODULUS_HEX: &str = "\
B88015E820E9BF7F1561297CC82A714A5C922A62E8584D8AFA22ED2F990FD148\
2BAD66C22F6DF467FA05BF994F1F72E61095306589FBA39BED5C13439B2717AB\
1BFB7F79C43BE529A261082019A34432A892D5FC937473D708FC2D14F72AEE51\
0776B481FC3815BBB5D22A2B14114CB48E9496EE95537300CB7C1CECE95091A1\
C38C8E4556B61984AA7047776C1E966243582587CCC629862E828A024872E310\
8B1D548DA8860B29511EEBAC4CBC1BF4617E8CF7B0FF251A5DF1959F7C9D5855\
906376CD3E5399D496B90097F3F4361B2AED3E4F1F0A3CCDDBB9A593E35EDFA8\
D0A5B134C4A8135BD2BA1BA5310EA7F606B2C1E74F0ED0239420F389CEBF18E1";
}
