//! The PKCS#11 token: session scope and key management.
//!
//! All token traffic runs through one authenticated read-write session.
//! Private keys are created non-extractable and never leave the token;
//! only the public components are read back to build DNSKEY records.

use std::path::Path;

use bytes::Bytes;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::UserType;
use cryptoki::types::{AuthPin, Ulong};
use domain::base::iana::SecAlg;
use tracing::{debug, info};

use crate::error::{Context, Error};
use crate::records::ZoneName;
use crate::sign::{SignRaw, SigningKey};

/// DNSKEY flags of a key signing key: ZONE and SEP.
pub const KSK_FLAGS: u16 = 257;

/// DNSKEY flags of a zone signing key: ZONE.
pub const ZSK_FLAGS: u16 = 256;

/// CKA_ID values distinguishing the two roles under a shared label.
const KSK_ID: &[u8] = b"ksk";
const ZSK_ID: &[u8] = b"zsk";

/// RSA modulus size for generated keys.
const MODULUS_BITS: u64 = 2048;

//------------ Session -------------------------------------------------------

/// An authenticated session with the token.
///
/// Logging out and closing the session happens when the value is dropped,
/// on every exit path. A session must not be shared between concurrent
/// tasks; the token serializes signing operations anyway.
pub struct Session {
    session: cryptoki::session::Session,
}

impl Session {
    /// Load the module, open a session on the first slot holding a token,
    /// and log in with the given user PIN.
    pub fn open(module: &Path, pin: &str) -> Result<Self, Error> {
        let pkcs11 = Pkcs11::new(module).map_err(|err| {
            Error::hsm(format!(
                "cannot load PKCS#11 module '{}': {err}",
                module.display()
            ))
        })?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(Error::from)
            .context("initializing the PKCS#11 module")?;

        let slot = pkcs11
            .get_slots_with_token()
            .map_err(Error::from)
            .context("enumerating token slots")?
            .into_iter()
            .next()
            .ok_or_else(|| Error::hsm("no slot with a token present"))?;

        let session = pkcs11
            .open_rw_session(slot)
            .map_err(Error::from)
            .context("opening a session")?;
        session
            .login(UserType::User, Some(&AuthPin::new(pin.into())))
            .map_err(Error::from)
            .context("logging in to the token")?;

        debug!("opened an authenticated session on slot {}", slot.id());
        Ok(Session { session })
    }

    fn raw(&self) -> &cryptoki::session::Session {
        &self.session
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The library closes the session itself; the login must not
        // outlive us.
        let _ = self.session.logout();
    }
}

//------------ HsmKey --------------------------------------------------------

/// A private key resident on the token.
pub struct HsmKey<'a> {
    session: &'a Session,
    handle: ObjectHandle,
}

impl SignRaw for HsmKey<'_> {
    fn algorithm(&self) -> SecAlg {
        SecAlg::RSASHA256
    }

    fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.session
            .raw()
            .sign(&Mechanism::Sha256RsaPkcs, self.handle, data)
            .map_err(|err| Error::hsm(format!("token signing operation failed: {err}")))
    }
}

//------------ KeyRing -------------------------------------------------------

/// Access to the key pairs stored under one label.
pub struct KeyRing<'a> {
    session: &'a Session,
    label: String,
}

impl<'a> KeyRing<'a> {
    pub fn new(session: &'a Session, label: &str) -> Self {
        KeyRing {
            session,
            label: label.into(),
        }
    }

    /// Look up the KSK and ZSK pairs under our label.
    ///
    /// Returns `None` when no key material exists yet. Finding only one of
    /// the two roles is an error: the token holds half a key set.
    pub fn find(
        &self,
        owner: &ZoneName,
    ) -> Result<Option<(SigningKey<HsmKey<'a>>, SigningKey<HsmKey<'a>>)>, Error> {
        let ksk = self.find_role(owner, KSK_ID, KSK_FLAGS)?;
        let zsk = self.find_role(owner, ZSK_ID, ZSK_FLAGS)?;
        match (ksk, zsk) {
            (Some(ksk), Some(zsk)) => Ok(Some((ksk, zsk))),
            (None, None) => Ok(None),
            _ => Err(Error::hsm(format!(
                "incomplete key material under label '{}'; \
                 run reset-keys and create a fresh pair",
                self.label
            ))),
        }
    }

    /// Generate a fresh KSK and ZSK pair under our label.
    pub fn create(
        &self,
        owner: &ZoneName,
    ) -> Result<(SigningKey<HsmKey<'a>>, SigningKey<HsmKey<'a>>), Error> {
        info!("creating new RSA-2048 key pairs under label '{}'", self.label);
        self.generate_role(KSK_ID)
            .context("generating the key signing key")?;
        self.generate_role(ZSK_ID)
            .context("generating the zone signing key")?;
        self.find(owner)?
            .ok_or_else(|| Error::hsm("keys missing from the token after generation"))
    }

    /// Destroy every object stored under our label.
    ///
    /// Destroying an empty label is not an error, so resetting twice
    /// succeeds twice.
    pub fn destroy_all(&self) -> Result<usize, Error> {
        let template = [
            Attribute::Token(true),
            Attribute::Label(self.label.as_bytes().to_vec()),
        ];
        let handles = self
            .session
            .raw()
            .find_objects(&template)
            .map_err(Error::from)
            .context("enumerating token objects")?;
        let count = handles.len();
        for handle in handles {
            self.session
                .raw()
                .destroy_object(handle)
                .map_err(Error::from)
                .context("destroying a token object")?;
        }
        info!("destroyed {count} objects under label '{}'", self.label);
        Ok(count)
    }

    fn find_role(
        &self,
        owner: &ZoneName,
        id: &[u8],
        flags: u16,
    ) -> Result<Option<SigningKey<HsmKey<'a>>>, Error> {
        let private = self.find_object(ObjectClass::PRIVATE_KEY, id)?;
        let Some(private) = private else {
            return Ok(None);
        };
        let public = self.find_object(ObjectClass::PUBLIC_KEY, id)?.ok_or_else(|| {
            Error::hsm(format!(
                "private key '{}' has no public half on the token",
                String::from_utf8_lossy(id)
            ))
        })?;

        let public_key = self.read_public_key(public)?;
        let key = SigningKey::new(
            owner.clone(),
            flags,
            public_key,
            HsmKey {
                session: self.session,
                handle: private,
            },
        )?;
        debug!(
            "found {} key with tag {} under label '{}'",
            String::from_utf8_lossy(id),
            key.key_tag(),
            self.label
        );
        Ok(Some(key))
    }

    fn find_object(
        &self,
        class: ObjectClass,
        id: &[u8],
    ) -> Result<Option<ObjectHandle>, Error> {
        let template = [
            Attribute::Token(true),
            Attribute::Class(class),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Label(self.label.as_bytes().to_vec()),
            Attribute::Id(id.to_vec()),
        ];
        let handles = self
            .session
            .raw()
            .find_objects(&template)
            .map_err(Error::from)
            .context("searching for key objects")?;
        Ok(handles.into_iter().next())
    }

    /// Read modulus and exponent of a public key object and assemble the
    /// DNSKEY public key field.
    fn read_public_key(&self, handle: ObjectHandle) -> Result<Bytes, Error> {
        let attributes = self
            .session
            .raw()
            .get_attributes(
                handle,
                &[AttributeType::PublicExponent, AttributeType::Modulus],
            )
            .map_err(Error::from)
            .context("reading public key attributes")?;

        let mut exponent = None;
        let mut modulus = None;
        for attribute in attributes {
            match attribute {
                Attribute::PublicExponent(value) => exponent = Some(value),
                Attribute::Modulus(value) => modulus = Some(value),
                _ => {}
            }
        }
        let (Some(exponent), Some(modulus)) = (exponent, modulus) else {
            return Err(Error::hsm(
                "token did not return the public key components",
            ));
        };

        Ok(rfc3110_public_key(&exponent, &modulus))
    }

    fn generate_role(&self, id: &[u8]) -> Result<(), Error> {
        let pub_template = [
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::ModulusBits(Ulong::from(MODULUS_BITS)),
            Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
            Attribute::Label(self.label.as_bytes().to_vec()),
            Attribute::Id(id.to_vec()),
        ];
        let priv_template = [
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(self.label.as_bytes().to_vec()),
            Attribute::Id(id.to_vec()),
        ];
        self.session
            .raw()
            .generate_key_pair(&Mechanism::RsaPkcsKeyPairGen, &pub_template, &priv_template)
            .map_err(Error::from)?;
        Ok(())
    }
}

/// The RFC 3110 wire form of an RSA public key: a length-prefixed exponent
/// followed by the modulus.
fn rfc3110_public_key(exponent: &[u8], modulus: &[u8]) -> Bytes {
    let mut key = Vec::with_capacity(3 + exponent.len() + modulus.len());
    if let Ok(len) = u8::try_from(exponent.len()) {
        key.push(len);
    } else {
        key.push(0);
        key.extend_from_slice(&(exponent.len() as u16).to_be_bytes());
    }
    key.extend_from_slice(exponent);
    key.extend_from_slice(modulus);
    Bytes::from(key)
}
