// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::new_without_default)]

use std::fmt;

use md5::{Digest as _, Md5};
use protos::build::bazel::remote::execution::v2 as remoting_protos;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

mod instance;
mod resource;
mod set;

pub use instance::{InstanceName, InstanceNameTrie};
pub use resource::{
    format_read_resource_name, format_write_resource_name, parse_read_resource_name,
    parse_write_resource_name, Compressor, ReadResourceName, ResourceError, WriteResourceName,
};
pub use set::DigestSet;

/// The hash algorithm component of a `Digest`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum DigestFunction {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Blake3,
}

impl DigestFunction {
    /// Functions considered when inferring the algorithm from a bare hash
    /// length, in precedence order. BLAKE3 shares SHA-256's length and is
    /// therefore only reachable by explicit selection.
    const INFERENCE_ORDER: [DigestFunction; 5] = [
        DigestFunction::Md5,
        DigestFunction::Sha1,
        DigestFunction::Sha256,
        DigestFunction::Sha384,
        DigestFunction::Sha512,
    ];

    /// Every function this storage plane can verify.
    pub const ALL: [DigestFunction; 6] = [
        DigestFunction::Md5,
        DigestFunction::Sha1,
        DigestFunction::Sha256,
        DigestFunction::Sha384,
        DigestFunction::Sha512,
        DigestFunction::Blake3,
    ];

    pub fn hash_len(&self) -> usize {
        match self {
            DigestFunction::Md5 => 16,
            DigestFunction::Sha1 => 20,
            DigestFunction::Sha256 => 32,
            DigestFunction::Sha384 => 48,
            DigestFunction::Sha512 => 64,
            DigestFunction::Blake3 => 32,
        }
    }

    /// Short name used in canonical digest keys and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            DigestFunction::Md5 => "md5",
            DigestFunction::Sha1 => "sha1",
            DigestFunction::Sha256 => "sha256",
            DigestFunction::Sha384 => "sha384",
            DigestFunction::Sha512 => "sha512",
            DigestFunction::Blake3 => "blake3",
        }
    }

    /// Infer the digest function from a hash length in bytes.
    pub fn from_hash_length(hash_len: usize) -> Result<Self, String> {
        Self::INFERENCE_ORDER
            .into_iter()
            .find(|f| f.hash_len() == hash_len)
            .ok_or_else(|| format!("No digest function has hashes of {hash_len} bytes"))
    }

    /// Resolve the digest function named by a request.
    ///
    /// When the wire value is `UNKNOWN` (the proto default), the algorithm is
    /// inferred from the hash length. Otherwise the named function wins, and
    /// the hash length must match it.
    pub fn resolve(wire_value: i32, hash_len: usize) -> Result<Self, String> {
        use remoting_protos::digest_function::Value;

        let named = match Value::from_i32(wire_value) {
            Some(Value::Unknown) => return Self::from_hash_length(hash_len),
            Some(Value::Md5) => DigestFunction::Md5,
            Some(Value::Sha1) => DigestFunction::Sha1,
            Some(Value::Sha256) => DigestFunction::Sha256,
            Some(Value::Sha384) => DigestFunction::Sha384,
            Some(Value::Sha512) => DigestFunction::Sha512,
            Some(Value::Blake3) => DigestFunction::Blake3,
            Some(other) => return Err(format!("Unsupported digest function {other:?}")),
            None => return Err(format!("Unknown digest function enum value {wire_value}")),
        };
        if named.hash_len() != hash_len {
            return Err(format!(
                "Hash length {hash_len} does not match digest function {}",
                named.name()
            ));
        }
        Ok(named)
    }

    pub fn to_proto(&self) -> remoting_protos::digest_function::Value {
        use remoting_protos::digest_function::Value;
        match self {
            DigestFunction::Md5 => Value::Md5,
            DigestFunction::Sha1 => Value::Sha1,
            DigestFunction::Sha256 => Value::Sha256,
            DigestFunction::Sha384 => Value::Sha384,
            DigestFunction::Sha512 => Value::Sha512,
            DigestFunction::Blake3 => Value::Blake3,
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            DigestFunction::Md5 => Hasher::Md5(Md5::default()),
            DigestFunction::Sha1 => Hasher::Sha1(Sha1::default()),
            DigestFunction::Sha256 => Hasher::Sha256(Sha256::default()),
            DigestFunction::Sha384 => Hasher::Sha384(Sha384::default()),
            DigestFunction::Sha512 => Hasher::Sha512(Box::new(Sha512::default())),
            DigestFunction::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

/// An incremental hasher for one of the supported digest functions.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Box<Sha512>),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
            Hasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Whether a canonical digest key includes the instance name.
///
/// Content-addressed stores share one blob across tenants and use
/// `WithoutInstance`; stores whose entries are only visible to the writer
/// (e.g. the Action Cache) use `WithInstance`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyFormat {
    WithInstance,
    WithoutInstance,
}

/// Identity of a blob: instance-name scope, digest function, hash and size.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Digest {
    instance_name: InstanceName,
    digest_function: DigestFunction,
    hash: Box<[u8]>,
    size_bytes: usize,
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest<{}:{}/{} @ {:?}>",
            self.digest_function.name(),
            hex::encode(&self.hash),
            self.size_bytes,
            self.instance_name.as_str(),
        )
    }
}

impl Digest {
    pub fn new(
        instance_name: InstanceName,
        digest_function: DigestFunction,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Self, String> {
        if hash.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(format!("Hash {hash:?} is not lowercase hexadecimal"));
        }
        let hash =
            hex::decode(hash).map_err(|err| format!("Hash {hash:?} is not hexadecimal: {err}"))?;
        if size_bytes < 0 {
            return Err(format!("Size {size_bytes} is negative"));
        }
        Self::from_raw(instance_name, digest_function, hash, size_bytes as usize)
    }

    pub fn from_raw(
        instance_name: InstanceName,
        digest_function: DigestFunction,
        hash: Vec<u8>,
        size_bytes: usize,
    ) -> Result<Self, String> {
        if hash.len() != digest_function.hash_len() {
            return Err(format!(
                "Hash {} has length {}, while {} requires {} bytes",
                hex::encode(&hash),
                hash.len(),
                digest_function.name(),
                digest_function.hash_len()
            ));
        }
        Ok(Digest {
            instance_name,
            digest_function,
            hash: hash.into_boxed_slice(),
            size_bytes,
        })
    }

    /// Compute the digest of `content` under the given function.
    pub fn of_bytes(
        instance_name: InstanceName,
        digest_function: DigestFunction,
        content: &[u8],
    ) -> Self {
        let mut hasher = digest_function.hasher();
        hasher.update(content);
        Digest {
            instance_name,
            digest_function,
            hash: hasher.finalize().into_boxed_slice(),
            size_bytes: content.len(),
        }
    }

    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    pub fn digest_function(&self) -> DigestFunction {
        self.digest_function
    }

    pub fn hash_bytes(&self) -> &[u8] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Rescope this digest to another instance name, e.g. when a routing
    /// layer rewrites the tenant prefix.
    pub fn with_instance_name(&self, instance_name: InstanceName) -> Self {
        Digest {
            instance_name,
            ..self.clone()
        }
    }

    /// Canonical string key for use in caches and in-flight maps.
    pub fn key(&self, format: KeyFormat) -> String {
        match format {
            KeyFormat::WithoutInstance => format!(
                "{}-{}-{}",
                hex::encode(&self.hash),
                self.size_bytes,
                self.digest_function.name()
            ),
            KeyFormat::WithInstance => format!(
                "{}-{}-{}-{}",
                hex::encode(&self.hash),
                self.size_bytes,
                self.digest_function.name(),
                self.instance_name.as_str()
            ),
        }
    }

    pub fn to_proto(&self) -> remoting_protos::Digest {
        remoting_protos::Digest {
            hash: hex::encode(&self.hash),
            size_bytes: self.size_bytes as i64,
        }
    }

    pub fn from_proto(
        instance_name: InstanceName,
        digest_function: DigestFunction,
        proto: &remoting_protos::Digest,
    ) -> Result<Self, String> {
        Self::new(
            instance_name,
            digest_function,
            &proto.hash,
            proto.size_bytes,
        )
    }
}

/// Extract and convert a required digest field from a request proto.
pub fn required_digest(
    field_name: &str,
    instance_name: InstanceName,
    digest_function: DigestFunction,
    api_digest_opt: Option<&remoting_protos::Digest>,
) -> Result<Digest, String> {
    let api_digest = api_digest_opt.ok_or_else(|| format!("Missing {field_name}"))?;
    Digest::from_proto(instance_name, digest_function, api_digest)
        .map_err(|err| format!("Malformed {field_name}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{Digest, DigestFunction, InstanceName, KeyFormat};
    use protos::build::bazel::remote::execution::v2 as remoting_protos;

    fn main_instance() -> InstanceName {
        InstanceName::new("main").unwrap()
    }

    #[test]
    fn parse_roundtrip() {
        for function in DigestFunction::ALL {
            let digest = Digest::of_bytes(main_instance(), function, b"foobar");
            let parsed = Digest::new(
                main_instance(),
                function,
                &digest.hash_hex(),
                digest.size_bytes() as i64,
            )
            .unwrap();
            assert_eq!(digest, parsed);
        }
    }

    #[test]
    fn rejects_bad_hashes() {
        let err = Digest::new(main_instance(), DigestFunction::Md5, "xyz", 0).unwrap_err();
        assert!(err.contains("\"xyz\""), "{err}");

        // Uppercase hex is not canonical.
        let err = Digest::new(
            main_instance(),
            DigestFunction::Md5,
            "09F7E02F1290BE211DA707A266F153B3",
            5,
        )
        .unwrap_err();
        assert!(err.contains("lowercase"), "{err}");

        // Valid hex, wrong length for the function.
        let err = Digest::new(main_instance(), DigestFunction::Sha256, "abcd", 0).unwrap_err();
        assert!(err.contains("sha256"), "{err}");

        // Negative size.
        let err = Digest::new(
            main_instance(),
            DigestFunction::Md5,
            "09f7e02f1290be211da707a266f153b3",
            -1,
        )
        .unwrap_err();
        assert!(err.contains("negative"), "{err}");
    }

    #[test]
    fn known_md5() {
        let digest = Digest::of_bytes(main_instance(), DigestFunction::Md5, b"Hello");
        assert_eq!(digest.hash_hex(), "8b1a9953c4611296a827abf8c47804d7");
        assert_eq!(digest.size_bytes(), 5);
    }

    #[test]
    fn known_sha256() {
        let digest = Digest::of_bytes(main_instance(), DigestFunction::Sha256, b"foobar");
        assert_eq!(
            digest.hash_hex(),
            "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2"
        );
    }

    #[test]
    fn function_resolution() {
        use remoting_protos::digest_function::Value;

        // UNKNOWN infers from the hash length.
        assert_eq!(
            DigestFunction::resolve(Value::Unknown as i32, 16).unwrap(),
            DigestFunction::Md5
        );
        assert_eq!(
            DigestFunction::resolve(Value::Unknown as i32, 20).unwrap(),
            DigestFunction::Sha1
        );
        // SHA-256 wins the 32-byte tie over BLAKE3.
        assert_eq!(
            DigestFunction::resolve(Value::Unknown as i32, 32).unwrap(),
            DigestFunction::Sha256
        );
        assert_eq!(
            DigestFunction::resolve(Value::Unknown as i32, 64).unwrap(),
            DigestFunction::Sha512
        );
        DigestFunction::resolve(Value::Unknown as i32, 17).unwrap_err();

        // An explicitly named function wins, but must match the length.
        assert_eq!(
            DigestFunction::resolve(Value::Blake3 as i32, 32).unwrap(),
            DigestFunction::Blake3
        );
        DigestFunction::resolve(Value::Blake3 as i32, 20).unwrap_err();
    }

    #[test]
    fn keys() {
        let digest = Digest::new(
            main_instance(),
            DigestFunction::Md5,
            "09f7e02f1290be211da707a266f153b3",
            5,
        )
        .unwrap();
        assert_eq!(
            digest.key(KeyFormat::WithoutInstance),
            "09f7e02f1290be211da707a266f153b3-5-md5"
        );
        assert_eq!(
            digest.key(KeyFormat::WithInstance),
            "09f7e02f1290be211da707a266f153b3-5-md5-main"
        );

        let rescoped = digest.with_instance_name(InstanceName::new("other/site").unwrap());
        assert_eq!(
            digest.key(KeyFormat::WithoutInstance),
            rescoped.key(KeyFormat::WithoutInstance)
        );
        assert_ne!(
            digest.key(KeyFormat::WithInstance),
            rescoped.key(KeyFormat::WithInstance)
        );
    }

    #[test]
    fn proto_roundtrip() {
        let digest = Digest::of_bytes(main_instance(), DigestFunction::Sha256, b"foobar");
        let proto = digest.to_proto();
        let back = Digest::from_proto(main_instance(), DigestFunction::Sha256, &proto).unwrap();
        assert_eq!(digest, back);
    }
}
