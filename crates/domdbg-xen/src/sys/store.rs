//! Xenstore client over the xenstored unix socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use crate::error::Error;

const XS_DIRECTORY: u32 = 1;
const XS_READ: u32 = 2;
const XS_ERROR: u32 = 16;

const SOCKET_PATHS: [&str; 2] = ["/run/xenstored/socket", "/var/run/xenstored/socket"];

/// Maximum accepted reply payload, per the xenstore protocol.
const XENSTORE_PAYLOAD_MAX: u32 = 4096;

/// Client connection to xenstored.
pub struct XenStore {
    stream: UnixStream,
    req_id: u32,
}

impl XenStore {
    /// Connects to the xenstored unix socket.
    pub fn connect() -> crate::Result<Self> {
        let mut last_err = None;

        for path in SOCKET_PATHS {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    tracing::debug!(path, "connected to xenstored");
                    return Ok(Self { stream, req_id: 0 });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.map_or(Error::BadStoreReply, Error::Io))
    }

    /// Reads the value of a store path.
    pub fn read(&mut self, path: &str) -> crate::Result<String> {
        let payload = self.request(XS_READ, path)?;

        String::from_utf8(payload).map_err(|_| Error::BadStoreReply)
    }

    /// Lists the children of a store directory.
    pub fn read_directory(&mut self, path: &str) -> crate::Result<Vec<String>> {
        let payload = self.request(XS_DIRECTORY, path)?;

        Ok(split_directory(&payload))
    }

    /// Guest domain IDs, from the store's `/local/domain` directory.
    pub fn guest_domain_ids(&mut self) -> crate::Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .read_directory("/local/domain")?
            .iter()
            .filter_map(|entry| entry.parse().ok())
            .collect();

        ids.sort_unstable();

        Ok(ids)
    }

    /// Name of the given domain.
    pub fn domain_name(&mut self, domid: u32) -> crate::Result<String> {
        self.read(&format!("/local/domain/{domid}/name"))
    }

    /// Resolves a domain name to its ID.
    pub fn domain_id_by_name(&mut self, name: &str) -> crate::Result<u32> {
        for domid in self.guest_domain_ids()? {
            if self.domain_name(domid)? == name {
                return Ok(domid);
            }
        }

        Err(Error::DomainNotFound(name.to_owned()))
    }

    fn request(&mut self, op: u32, path: &str) -> crate::Result<Vec<u8>> {
        self.req_id = self.req_id.wrapping_add(1);

        let message = encode_request(op, self.req_id, path);
        self.stream.write_all(&message)?;

        let mut header = [0u8; 16];
        self.stream.read_exact(&mut header)?;

        let (reply_op, reply_id, len) = parse_header(header);

        if reply_id != self.req_id || len > XENSTORE_PAYLOAD_MAX {
            return Err(Error::BadStoreReply);
        }

        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload)?;

        if reply_op == XS_ERROR {
            let name = String::from_utf8_lossy(strip_nul(&payload)).into_owned();
            return Err(Error::Store(name));
        }

        if reply_op != op {
            return Err(Error::BadStoreReply);
        }

        Ok(strip_nul(&payload).to_vec())
    }
}

/// Builds one request message: a `(type, req_id, tx_id, len)` header of
/// little-endian `u32`s followed by the NUL-terminated path.
fn encode_request(op: u32, req_id: u32, path: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(16 + path.len() + 1);

    message.extend_from_slice(&op.to_le_bytes());
    message.extend_from_slice(&req_id.to_le_bytes());
    message.extend_from_slice(&0u32.to_le_bytes());
    message.extend_from_slice(&(path.len() as u32 + 1).to_le_bytes());
    message.extend_from_slice(path.as_bytes());
    message.push(0);

    message
}

/// Splits a reply header into `(type, req_id, payload_len)`.
fn parse_header(header: [u8; 16]) -> (u32, u32, u32) {
    let word = |i: usize| {
        u32::from_le_bytes([
            header[i * 4],
            header[i * 4 + 1],
            header[i * 4 + 2],
            header[i * 4 + 3],
        ])
    };

    (word(0), word(1), word(3))
}

/// Splits a directory payload into its NUL-separated entries.
fn split_directory(payload: &[u8]) -> Vec<String> {
    payload
        .split(|&b| b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
        .collect()
}

fn strip_nul(payload: &[u8]) -> &[u8] {
    payload.strip_suffix(&[0]).unwrap_or(payload)
}
