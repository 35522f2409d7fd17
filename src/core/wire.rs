/*!
 * Worker-subprocess wire protocol (C5)
 *
 * Length-prefixed request/reply frames exchanged over a pipe pair with a
 * proxy child. Grounded on `examples/original_source/nsproxy/nsproxylib.c`'s
 * `Req`/`Res` structs and `SendBuf`/`RecvBuf`/`Import`.
 */

use std::io::{self, Read, Write};

pub const PROTOCOL_MAJOR: u16 = 1;
pub const PROTOCOL_MINOR: u16 = 1;

/// A request frame sent parent -> child: a script to evaluate.
#[derive(Debug, Clone)]
pub struct Request {
    pub major: u16,
    pub minor: u16,
    pub script: Vec<u8>,
}

impl Request {
    pub fn new(script: impl Into<Vec<u8>>) -> Self {
        Self {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            script: script.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.script.len());
        buf.extend_from_slice(&(self.script.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.major.to_be_bytes());
        buf.extend_from_slice(&self.minor.to_be_bytes());
        buf.extend_from_slice(&self.script);
        buf
    }

    pub fn read_from(mut r: impl Read) -> io::Result<Self> {
        let mut header = [0u8; 8];
        r.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let major = u16::from_be_bytes(header[4..6].try_into().unwrap());
        let minor = u16::from_be_bytes(header[6..8].try_into().unwrap());
        let mut script = vec![0u8; len];
        r.read_exact(&mut script)?;
        Ok(Self { major, minor, script })
    }

    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// A reply frame sent child -> parent: evaluation outcome.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub code: u32,
    pub err_code: Vec<u8>,
    pub err_info: Vec<u8>,
    pub result: Vec<u8>,
}

impl Reply {
    pub fn ok(result: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            err_code: Vec::new(),
            err_info: Vec::new(),
            result: result.into(),
        }
    }

    pub fn error(code: u32, err_code: impl Into<Vec<u8>>, err_info: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            err_code: err_code.into(),
            err_info: err_info.into(),
            result: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16 + self.err_code.len() + self.err_info.len() + self.result.len());
        body.extend_from_slice(&self.code.to_be_bytes());
        body.extend_from_slice(&(self.err_code.len() as u32).to_be_bytes());
        body.extend_from_slice(&(self.err_info.len() as u32).to_be_bytes());
        body.extend_from_slice(&(self.result.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.err_code);
        body.extend_from_slice(&self.err_info);
        body.extend_from_slice(&self.result);

        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    pub fn read_from(mut r: impl Read) -> io::Result<Self> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let total_len = u32::from_be_bytes(len_buf) as usize;

        let mut body = vec![0u8; total_len];
        r.read_exact(&mut body)?;

        if body.len() < 16 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "reply header truncated"));
        }

        let code = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let err_code_len = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
        let err_info_len = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
        let result_len = u32::from_be_bytes(body[12..16].try_into().unwrap()) as usize;

        let mut offset = 16;
        let err_code = body
            .get(offset..offset + err_code_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "reply errCode truncated"))?
            .to_vec();
        offset += err_code_len;
        let err_info = body
            .get(offset..offset + err_info_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "reply errInfo truncated"))?
            .to_vec();
        offset += err_info_len;
        let result = body
            .get(offset..offset + result_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "reply result truncated"))?
            .to_vec();

        Ok(Self {
            code,
            err_code,
            err_info,
            result,
        })
    }

    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// Builds a proxy id of the form `<poolname>-proxy-<seq>`, truncating the
/// pool name so the whole id stays within `max_len` (64 in the donor).
pub fn proxy_id(pool_name: &str, seq: u64, max_len: usize) -> String {
    let suffix = format!("-proxy-{}", seq);
    let budget = max_len.saturating_sub(suffix.len());
    let truncated: String = pool_name.chars().take(budget).collect();
    format!("{}{}", truncated, suffix)
}
