// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A minimal, fixed IPP `Get-Printer-Attributes` request/response codec.
//! This is not a general IPP library: spec.md's Non-goals exclude
//! implementing IPP, but constructing and parsing this one request is
//! in scope, the same way `examples/original_source/src/capabilities.c`
//! builds one fixed request by hand.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const IPP_VERSION: [u8; 2] = [0x02, 0x00];
const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000b;
const GROUP_OPERATION_ATTRIBUTES: u8 = 0x01;
const GROUP_END_OF_ATTRIBUTES: u8 = 0x03;

const TAG_CHARSET: u8 = 0x47;
const TAG_NATURAL_LANGUAGE: u8 = 0x48;
const TAG_URI: u8 = 0x45;
const TAG_KEYWORD: u8 = 0x44;

#[derive(Debug)]
pub enum Error {
    Connect(std::io::Error),
    Io(std::io::Error),
    Http(String),
    Truncated,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Connect(e) => write!(f, "Failed to connect to loopback IPP service: {}", e),
            Error::Io(e) => write!(f, "I/O error talking to loopback IPP service: {}", e),
            Error::Http(s) => write!(f, "Unexpected HTTP response: {}", s),
            Error::Truncated => write!(f, "IPP response was truncated"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds and sends a `Get-Printer-Attributes` request to
/// `http://127.0.0.1:<port>/ipp/print`, wrapping it in a minimal
/// Content-Type: application/ipp HTTP/1.1 POST, and returns the
/// attribute map flattened into `name -> Vec<value>` (multi-valued
/// attributes like `media-size-supported` keep every occurrence).
pub fn get_printer_attributes(port: u16) -> Result<HashMap<String, Vec<String>>> {
    let uri = format!("http://127.0.0.1:{}/ipp/print", port);
    let body = build_request(&uri);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).map_err(Error::Connect)?;
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .map_err(Error::Io)?;

    let request = format!(
        "POST /ipp/print HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Content-Type: application/ipp\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        port,
        body.len()
    );
    stream.write_all(request.as_bytes()).map_err(Error::Io)?;
    stream.write_all(&body).map_err(Error::Io)?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).map_err(Error::Io)?;

    let split = find_header_end(&response).ok_or(Error::Truncated)?;
    let (header, ipp_body) = response.split_at(split);
    let header_str = String::from_utf8_lossy(header);
    let mut lines = header_str.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    if !status_line.contains("200") {
        return Err(Error::Http(status_line.to_string()));
    }

    parse_response(ipp_body)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn build_request(uri: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&IPP_VERSION);
    body.extend_from_slice(&OP_GET_PRINTER_ATTRIBUTES.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes()); // request-id
    body.push(GROUP_OPERATION_ATTRIBUTES);
    push_attribute(&mut body, TAG_CHARSET, "attributes-charset", "utf-8");
    push_attribute(&mut body, TAG_NATURAL_LANGUAGE, "attributes-natural-language", "en");
    push_attribute(&mut body, TAG_URI, "printer-uri", uri);
    push_attribute(&mut body, TAG_KEYWORD, "requested-attributes", "all");
    body.push(GROUP_END_OF_ATTRIBUTES);
    body
}

fn push_attribute(buf: &mut Vec<u8>, tag: u8, name: &str, value: &str) {
    buf.push(tag);
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Walks the IPP attribute-value pairs in the response body, always
/// advancing the cursor even for attributes with an empty name (the
/// original `ipp_request`'s silent no-advance `continue` on an unnamed
/// attribute is a documented infinite-loop bug, per spec.md section 9 --
/// this walker advances unconditionally).
fn parse_response(body: &[u8]) -> Result<HashMap<String, Vec<String>>> {
    let mut attrs: HashMap<String, Vec<String>> = HashMap::new();
    if body.len() < 8 {
        return Err(Error::Truncated);
    }

    let mut cursor = 8usize; // skip version(2) + status-code(2) + request-id(4)
    let mut last_name = String::new();

    while cursor < body.len() {
        let tag = body[cursor];
        cursor += 1;

        if tag == GROUP_END_OF_ATTRIBUTES {
            break;
        }
        if tag < 0x10 {
            // Delimiter tag (operation/job/printer/unsupported group);
            // carries no name/value pair.
            continue;
        }

        let Some((name_len, next)) = read_u16(body, cursor) else {
            break;
        };
        cursor = next;
        let Some(name_bytes) = body.get(cursor..cursor + name_len as usize) else {
            break;
        };
        cursor += name_len as usize;

        let Some((value_len, next)) = read_u16(body, cursor) else {
            break;
        };
        cursor = next;
        let Some(value_bytes) = body.get(cursor..cursor + value_len as usize) else {
            break;
        };
        cursor += value_len as usize;

        let name = if name_bytes.is_empty() {
            // A zero-length name means "additional value of the previous
            // attribute", per the IPP encoding (RFC 8010 section 3.1.3).
            last_name.clone()
        } else {
            let decoded = String::from_utf8_lossy(name_bytes).into_owned();
            last_name = decoded.clone();
            decoded
        };

        let value = decode_value(tag, value_bytes);
        attrs.entry(name).or_default().push(value);
    }

    Ok(attrs)
}

fn read_u16(body: &[u8], at: usize) -> Option<(u16, usize)> {
    let bytes = body.get(at..at + 2)?;
    Some((u16::from_be_bytes([bytes[0], bytes[1]]), at + 2))
}

fn decode_value(tag: u8, bytes: &[u8]) -> String {
    match tag {
        // integer, boolean, enum: 4-byte big-endian values.
        0x21 | 0x22 | 0x23 if bytes.len() == 4 => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_contains_printer_uri() {
        let body = build_request("http://127.0.0.1:60000/ipp/print");
        let body_str = String::from_utf8_lossy(&body);
        assert!(body_str.contains("printer-uri"));
        assert!(body_str.contains("127.0.0.1:60000"));
    }

    #[test]
    fn parse_response_collects_multivalued_attribute() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0, 0, 0, 1]);
        body.push(0x01); // operation-attributes-tag
        push_attribute(&mut body, TAG_KEYWORD, "document-format-supported", "application/pdf");
        body.push(TAG_KEYWORD);
        body.extend_from_slice(&0u16.to_be_bytes()); // zero-length name: additional value
        let value = b"image/jpeg";
        body.extend_from_slice(&(value.len() as u16).to_be_bytes());
        body.extend_from_slice(value);
        body.push(GROUP_END_OF_ATTRIBUTES);

        let attrs = parse_response(&body).unwrap();
        let formats = attrs.get("document-format-supported").unwrap();
        assert_eq!(formats, &vec!["application/pdf".to_string(), "image/jpeg".to_string()]);
    }

    #[test]
    fn parse_response_handles_truncated_body() {
        let body = [0x02, 0x00];
        assert!(matches!(parse_response(&body), Err(Error::Truncated)));
    }
}
