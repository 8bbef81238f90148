// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Message framing and the decoded shapes of the replies the core consumes.
//!
//! Documents are opaque byte strings here; producing and parsing them is the job of a [`Codec`].

#![allow(clippy::float_cmp)]

use {
	crate::*,
	std::{io::{self, Read, Write}, collections::HashMap, sync::atomic::{AtomicI32, Ordering}, time::{Duration, SystemTime, UNIX_EPOCH}},
	serde::{Serialize, Deserialize},
	serde_bytes::ByteBuf
};

pub const MIN_WIRE_VERSION: i32 = 6;
pub const MAX_WIRE_VERSION: i32 = 25;
pub const MAX_MESSAGE_SIZE: u32 = 48_000_000;
#[cfg(feature = "compress")]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[Compressor::Zstd];
#[cfg(not(feature = "compress"))]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[];

const HEADER_LEN:             usize = 16;
const COMPRESSION_HEADER_LEN: usize = 9;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocates a request id unique within this process.
pub fn next_request_id() -> i32 {
	REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidReplyError {
	#[error("unexpected op code")]
	OpCode,
	#[error("reply does not answer the request")]
	ResponseTo,
	#[error("unsupported payload type")]
	PayloadType,
	#[error("invalid message length {0}")]
	MessageLength(u32),
	#[error("invalid or unsupported compressor")]
	Compression
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Compressed   = 2012,
	Msg          = 2013
}

impl OpCode {
	fn from_le_bytes(buf: [u8; 4]) -> io::Result<Self> {
		match i32::from_le_bytes(buf) {
			2012 => Ok(Self::Compressed),
			2013 => Ok(Self::Msg),
			_    => Err(io::Error::new(io::ErrorKind::InvalidData, "invalid op code"))
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: u32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn read(reader: &mut impl Read) -> io::Result<Self> {
		let mut buf = [0u8; HEADER_LEN];
		reader.read_exact(&mut buf)?;
		Self::copy_from_slice(&buf)
	}

	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	fn copy_from_slice(buf: &[u8]) -> io::Result<Self> {
		Ok(Self {
			message_length: u32::from_le_bytes([buf[0], buf[1], buf[2],  buf[3]]),
			request_id:     i32::from_le_bytes([buf[4], buf[5], buf[6],  buf[7]]),
			response_to:    i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
			op_code:        OpCode::from_le_bytes([buf[12], buf[13], buf[14], buf[15]])?
		})
	}
}

struct CompressionData {
	original_opcode:   OpCode,
	uncompressed_size: u32,
	compressor_id:     Compressor
}

impl CompressionData {
	fn copy_from_slice(buf: &[u8]) -> Result<Self> {
		if buf.len() < COMPRESSION_HEADER_LEN {
			return Err(Error::InvalidReply(InvalidReplyError::Compression));
		}

		Ok(Self {
			original_opcode:   OpCode::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])?,
			uncompressed_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
			compressor_id:     match buf[8] {
				0 => Compressor::Noop,
				1 => Compressor::Snappy,
				2 => Compressor::Zlib,
				3 => Compressor::Zstd,
				_ => return Err(Error::InvalidReply(InvalidReplyError::Compression))
			}
		})
	}

	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&(self.original_opcode as i32).to_le_bytes());
		slice[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
		slice[8] = self.compressor_id as _;
	}
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compressor {
	Noop   = 0,
	Snappy = 1,
	Zlib   = 2,
	Zstd   = 3
}

impl std::str::FromStr for Compressor {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"noop"   => Self::Noop,
			"snappy" => Self::Snappy,
			"zlib"   => Self::Zlib,
			"zstd"   => Self::Zstd,
			_ => return Err(())
		})
	}
}

impl Serialize for Compressor {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> where
		S: serde::Serializer {
		serializer.serialize_str(match self {
			Self::Noop   => "noop",
			Self::Snappy => "snappy",
			Self::Zlib   => "zlib",
			Self::Zstd   => "zstd"
		})
	}
}

impl<'de> Deserialize<'de> for Compressor {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: serde::Deserializer<'de> {
		Ok(String::deserialize(deserializer)?.parse().unwrap_or(Self::Noop))
	}
}

fn compress(compressor: Compressor, data: &[u8]) -> Result<Vec<u8>> {
	match compressor {
		Compressor::Noop => Ok(data.to_vec()),
		#[cfg(feature = "compress")]
		Compressor::Zstd => {
			let mut encoder = zstd::Encoder::new(Vec::with_capacity(data.len()), 0)?;
			encoder.write_all(data)?;
			Ok(encoder.finish()?)
		}
		compressor => Err(Error::InvalidArgument(format!("unsupported compressor: {:?}", compressor)))
	}
}

fn decompress(compressor: Compressor, data: &[u8]) -> Result<Vec<u8>> {
	match compressor {
		Compressor::Noop => Ok(data.to_vec()),
		#[cfg(feature = "compress")]
		Compressor::Zstd => Ok(zstd::stream::decode_all(data)?),
		_ => Err(Error::InvalidReply(InvalidReplyError::Compression))
	}
}

/// Frames `payload` as an `OP_MSG` with a single body section, compressed if requested.
pub fn encode_message(
	request_id:  i32,
	response_to: i32,
	compression: Option<Compressor>,
	payload:     &[u8]
) -> Result<Vec<u8>> {
	let mut body = Vec::with_capacity(5 + payload.len());
	body.extend_from_slice(&0u32.to_le_bytes()); // flag bits
	body.push(0); // payload type
	body.extend_from_slice(payload);

	match compression {
		None => {
			let mut buf = vec![0u8; HEADER_LEN];
			buf.extend_from_slice(&body);
			Header {
				message_length: buf.len() as _,
				request_id,
				response_to,
				op_code:        OpCode::Msg
			}.copy_to_slice(&mut buf[..HEADER_LEN]);
			Ok(buf)
		}
		Some(compressor) => {
			let mut buf = vec![0u8; HEADER_LEN + COMPRESSION_HEADER_LEN];
			buf.extend_from_slice(&compress(compressor, &body)?);
			Header {
				message_length: buf.len() as _,
				request_id,
				response_to,
				op_code:        OpCode::Compressed
			}.copy_to_slice(&mut buf[..HEADER_LEN]);
			CompressionData {
				original_opcode:   OpCode::Msg,
				uncompressed_size: body.len() as _,
				compressor_id:     compressor
			}.copy_to_slice(&mut buf[HEADER_LEN..HEADER_LEN + COMPRESSION_HEADER_LEN]);
			Ok(buf)
		}
	}
}

/// Reads one message, returning its header and the uncompressed message body.
pub fn read_message(reader: &mut impl Read) -> Result<(Header, Vec<u8>)> {
	let mut header = Header::read(reader)?;
	if (header.message_length as usize) < HEADER_LEN || header.message_length > MAX_MESSAGE_SIZE {
		return Err(Error::InvalidReply(InvalidReplyError::MessageLength(header.message_length)));
	}

	let mut buf = vec![0u8; header.message_length as usize - HEADER_LEN];
	reader.read_exact(&mut buf)?;

	if header.op_code == OpCode::Compressed {
		let data = CompressionData::copy_from_slice(&buf)?;
		let body = decompress(data.compressor_id, &buf[COMPRESSION_HEADER_LEN..])?;
		if body.len() != data.uncompressed_size as usize {
			return Err(Error::InvalidReply(InvalidReplyError::Compression));
		}
		header.op_code = data.original_opcode;
		buf = body;
	}

	Ok((header, buf))
}

pub trait Wire: Read + Write + Sized {
	/// Sends a request with the given request id.
	fn send(&mut self, request_id: i32, compression: Option<Compressor>, payload: &[u8]) -> Result<()> {
		self.write_all(&encode_message(request_id, 0, compression, payload)?)?;
		self.flush()?;
		Ok(())
	}

	/// Receives the reply to the given request id, returning the body document.
	fn recv(&mut self, request_id: i32) -> Result<Vec<u8>> {
		let (header, mut buf) = read_message(self)?;

		if header.op_code != OpCode::Msg {
			Err(Error::InvalidReply(InvalidReplyError::OpCode))
		} else if header.response_to != request_id {
			Err(Error::InvalidReply(InvalidReplyError::ResponseTo))
		} else if buf.len() < 5 || buf[4] != 0 {
			Err(Error::InvalidReply(InvalidReplyError::PayloadType))
		} else {
			Ok(buf.split_off(5))
		}
	}
}

impl<T: Read + Write> Wire for T {}

/// Encodes the commands and decodes the replies the core itself issues or inspects.
pub trait Codec: Send + Sync + std::fmt::Debug {
	fn encode_hello(&self, command: &HelloCommand) -> Result<Vec<u8>>;

	fn decode_hello(&self, reply: &[u8]) -> Result<HelloReply>;

	/// Extracts the status fields common to every command reply.
	fn decode_status(&self, reply: &[u8]) -> Result<CommandStatus>;
}

/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloCommand<'a> {
	pub hello:       i32,
	pub hello_ok:    bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client:      Option<ClientMetadata<'a>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub compression: Option<&'a [Compressor]>,
	#[serde(rename = "$db")]
	pub db:          &'a str
}

impl<'a> HelloCommand<'a> {
	/// The initial handshake carries client metadata, heartbeats on an established connection don't.
	pub fn new(metadata: Option<ClientMetadata<'a>>, compression: Option<&'a [Compressor]>) -> Self {
		Self { hello: 1, hello_ok: true, client: metadata, compression, db: "admin" }
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub application: Option<ClientMetadataApplication<'a>>,
	pub driver:      ClientMetadataDriver<'a>,
	pub os:          ClientMetadataOs<'a>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub platform:    Option<&'a str>
}

impl<'a> ClientMetadata<'a> {
	pub fn new(appname: Option<&'a str>) -> Self {
		Self {
			application: appname.map(|name| ClientMetadataApplication { name }),
			..Self::default()
		}
	}
}

impl Default for ClientMetadata<'_> {
	fn default() -> Self {
		Self {
			application: None,
			driver: ClientMetadataDriver {
				name:    crate::DRIVER_NAME,
				version: env!("CARGO_PKG_VERSION")
			},
			os: ClientMetadataOs {
				r#type:       std::env::consts::OS,
				name:         None,
				architecture: Some(std::env::consts::ARCH),
				version:      None
			},
			platform: None
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadataApplication<'a> {
	pub name: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadataDriver<'a> {
	pub name:    &'a str,
	pub version: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadataOs<'a> {
	#[serde(rename = "type")]
	pub r#type:       &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name:         Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub architecture: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub version:      Option<&'a str>
}

/// The fields of a hello reply that discovery and monitoring consume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
	pub ok:                              f64,
	pub errmsg:                          Option<String>,
	pub code:                            Option<i32>,
	#[serde(alias = "ismaster")]
	pub is_writable_primary:             bool,
	pub secondary:                       bool,
	pub arbiter_only:                    bool,
	pub hidden:                          bool,
	pub passive:                         bool,
	#[serde(rename = "isreplicaset")]
	pub is_replica_set:                  bool,
	// sharded instances
	pub msg:                             Option<String>,
	// replica sets
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ElectionId>,
	pub primary:                         Option<String>,
	pub me:                              Option<String>,
	pub hosts:                           Vec<String>,
	pub passives:                        Vec<String>,
	pub arbiters:                        Vec<String>,
	pub tags:                            HashMap<String, String>,
	pub last_write:                      Option<LastWrite>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub logical_session_timeout_minutes: Option<i64>,
	pub compression:                     Vec<Compressor>,
	#[serde(rename = "$clusterTime")]
	pub cluster_time:                    Option<ClusterTime>
}

impl HelloReply {
	pub fn is_ok(&self) -> bool {
		self.ok == 1f64
	}

	pub fn error(&self) -> Option<CommandError> {
		(!self.is_ok()).then(|| CommandError {
			code:      MongoError::from(self.code.unwrap_or(0)),
			code_name: None,
			message:   self.errmsg.clone().unwrap_or_default(),
			labels:    Vec::new()
		})
	}
}

/// An `ObjectId` a primary stamps with its election term; later elections compare greater.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ElectionId(pub ByteBuf);

impl ElectionId {
	/// The id a server of wire version 17 or later uses for the given term.
	pub fn from_term(term: u64) -> Self {
		let mut bytes = vec![0x7f, 0xff, 0xff, 0xff];
		bytes.extend_from_slice(&term.to_be_bytes());
		Self(ByteBuf::from(bytes))
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	/// Milliseconds since the unix epoch.
	pub last_write_date: i64
}

impl LastWrite {
	pub fn date(&self) -> SystemTime {
		UNIX_EPOCH + Duration::from_millis(self.last_write_date.max(0) as u64)
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
	pub t: u32,
	pub i: u32
}

/// The logical clock gossiped between servers and clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
	pub cluster_time: Timestamp
}

/// Status fields present in every command reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandStatus {
	pub ok:                  f64,
	pub errmsg:              Option<String>,
	pub code:                Option<i32>,
	pub code_name:           Option<String>,
	pub error_labels:        Vec<String>,
	pub write_concern_error: Option<WriteConcernError>,
	#[serde(rename = "$clusterTime")]
	pub cluster_time:        Option<ClusterTime>
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteConcernError {
	pub code:         i32,
	pub code_name:    Option<String>,
	pub errmsg:       String,
	pub error_labels: Vec<String>
}

impl CommandStatus {
	/// The error this reply reports, a write concern error included.
	pub fn error(&self) -> Option<CommandError> {
		if self.ok != 1f64 {
			Some(CommandError {
				code:      MongoError::from(self.code.unwrap_or(0)),
				code_name: self.code_name.clone(),
				message:   self.errmsg.clone().unwrap_or_default(),
				labels:    self.error_labels.clone()
			})
		} else {
			self.write_concern_error.as_ref().map(|wce| CommandError {
				code:      MongoError::from(wce.code),
				code_name: wce.code_name.clone(),
				message:   wce.errmsg.clone(),
				labels:    self.error_labels.iter().chain(&wce.error_labels).cloned().collect()
			})
		}
	}
}
