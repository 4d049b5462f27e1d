//! Byte-level codec for method calls and the remote-type exchange.
//!
//! Call layout: 1 byte method id, 4 byte network timeout in
//! milliseconds, 1 byte status, 1 byte exception kind, 1 byte syncher
//! id, 4 byte thread UID, 2 byte method-call index, then the
//! parameter cells up to the end of the frame (calls are framed by
//! the transport).
//!
//! A parameter cell starts with a tag byte: 0 null, 1 number, 2
//! object. Numbers carry a self-describing lead byte: the low bits
//! select the width (or encode a small constant inline), the high bit
//! flags a trailing unit id. Objects carry a 2 byte type UID followed
//! by the type's payload.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use axon_core::{TypeInfo, TypeRegistry, TypeUid, Unit, WireError};

use crate::call::{CallError, CallStatus, MethodCall, Number, Param};

const TAG_NULL: u8 = 0;
const TAG_NUMBER: u8 = 1;
const TAG_OBJECT: u8 = 2;

const NUM_I16: u8 = 1;
const NUM_I32: u8 = 2;
const NUM_I64: u8 = 3;
const NUM_F32: u8 = 4;
const NUM_F64: u8 = 5;
/// Lead bytes `NUM_CONST_BASE..=0x7f` encode the integer
/// `lead - NUM_CONST_BASE` inline (0..=120).
const NUM_CONST_BASE: u8 = 7;
const NUM_CONST_MAX: i64 = (0x7f - NUM_CONST_BASE) as i64;
const UNIT_FLAG: u8 = 0x80;

/// Serialize a call into one wire frame.
pub fn serialize_call(call: &MethodCall, dst: &mut BytesMut) {
    dst.put_u8(call.method_index);
    dst.put_u32(call.net_timeout.as_millis() as u32);
    dst.put_u8(call.status.to_wire());
    dst.put_u8(call.exception.map(CallError::to_wire).unwrap_or(0));
    dst.put_i8(call.syncher_id);
    dst.put_u32(call.thread_uid);
    dst.put_u16(call.call_index);
    for param in &call.params {
        write_param(param, dst);
    }
}

/// Deserialize one wire frame. Object parameters are instantiated
/// through the registry; `remote_types` reconciles the peer's UID
/// space when present.
pub fn deserialize_call(
    src: &mut Bytes,
    registry: &TypeRegistry,
    remote_types: Option<&RemoteTypes>,
) -> Result<Box<MethodCall>, WireError> {
    if src.remaining() < 14 {
        return Err(WireError::Truncated);
    }
    let mut call = MethodCall::obtain();
    call.method_index = src.get_u8();
    call.net_timeout = Duration::from_millis(src.get_u32() as u64);
    call.status = CallStatus::from_wire(src.get_u8())?;
    call.exception = CallError::from_wire(src.get_u8())?;
    call.syncher_id = src.get_i8();
    call.thread_uid = src.get_u32();
    call.call_index = src.get_u16();
    while src.has_remaining() {
        let param = read_param(src, registry, remote_types)?;
        call.params.push(param);
    }
    Ok(call)
}

fn write_param(param: &Param, dst: &mut BytesMut) {
    match param {
        Param::Null => dst.put_u8(TAG_NULL),
        Param::Number { value, unit } => {
            dst.put_u8(TAG_NUMBER);
            write_number(*value, *unit, dst);
        }
        Param::Object { type_uid, value } => {
            dst.put_u8(TAG_OBJECT);
            dst.put_u16(type_uid.0);
            value.encode(dst);
        }
    }
}

fn read_param(
    src: &mut Bytes,
    registry: &TypeRegistry,
    remote_types: Option<&RemoteTypes>,
) -> Result<Param, WireError> {
    if !src.has_remaining() {
        return Err(WireError::Truncated);
    }
    match src.get_u8() {
        TAG_NULL => Ok(Param::Null),
        TAG_NUMBER => {
            let (value, unit) = read_number(src)?;
            Ok(Param::Number { value, unit })
        }
        TAG_OBJECT => {
            if src.remaining() < 2 {
                return Err(WireError::Truncated);
            }
            let wire_uid = src.get_u16();
            let info = match remote_types {
                Some(remote) => remote.resolve(wire_uid),
                None => registry.lookup_uid(TypeUid(wire_uid)),
            }
            .ok_or(WireError::UnknownTypeUid(wire_uid))?;
            let mut value = info
                .create_instance(false)
                .ok_or(WireError::UnknownTypeUid(wire_uid))?;
            value.decode(src)?;
            Ok(Param::Object {
                type_uid: info.uid(),
                value,
            })
        }
        other => Err(WireError::InvalidTag(other)),
    }
}

fn write_number(value: Number, unit: Unit, dst: &mut BytesMut) {
    let unit_flag = if unit != Unit::None { UNIT_FLAG } else { 0 };
    match value {
        Number::I64(v) if (0..=NUM_CONST_MAX).contains(&v) => {
            dst.put_u8(NUM_CONST_BASE + v as u8 | unit_flag);
        }
        Number::I16(v) => {
            dst.put_u8(NUM_I16 | unit_flag);
            dst.put_i16(v);
        }
        Number::I32(v) => {
            dst.put_u8(NUM_I32 | unit_flag);
            dst.put_i32(v);
        }
        Number::I64(v) => {
            dst.put_u8(NUM_I64 | unit_flag);
            dst.put_i64(v);
        }
        Number::F32(v) => {
            dst.put_u8(NUM_F32 | unit_flag);
            dst.put_f32(v);
        }
        Number::F64(v) => {
            dst.put_u8(NUM_F64 | unit_flag);
            dst.put_f64(v);
        }
    }
    if unit_flag != 0 {
        dst.put_u8(unit.id());
    }
}

fn read_number(src: &mut Bytes) -> Result<(Number, Unit), WireError> {
    if !src.has_remaining() {
        return Err(WireError::Truncated);
    }
    let lead = src.get_u8();
    let has_unit = lead & UNIT_FLAG != 0;
    let value = match lead & !UNIT_FLAG {
        NUM_I16 => {
            ensure(src, 2)?;
            Number::I16(src.get_i16())
        }
        NUM_I32 => {
            ensure(src, 4)?;
            Number::I32(src.get_i32())
        }
        NUM_I64 => {
            ensure(src, 8)?;
            Number::I64(src.get_i64())
        }
        NUM_F32 => {
            ensure(src, 4)?;
            Number::F32(src.get_f32())
        }
        NUM_F64 => {
            ensure(src, 8)?;
            Number::F64(src.get_f64())
        }
        c if c >= NUM_CONST_BASE => Number::I64((c - NUM_CONST_BASE) as i64),
        other => return Err(WireError::InvalidTag(other)),
    };
    let unit = if has_unit {
        ensure(src, 1)?;
        Unit::from_id(src.get_u8()).ok_or(WireError::InvalidTag(lead))?
    } else {
        Unit::None
    };
    Ok((value, unit))
}

fn ensure(src: &Bytes, len: usize) -> Result<(), WireError> {
    if src.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

fn write_string(s: &str, dst: &mut BytesMut) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

fn read_string(src: &mut Bytes) -> Result<String, WireError> {
    ensure(src, 2)?;
    let len = src.get_u16() as usize;
    ensure(src, len)?;
    let raw = src.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidString)
}

/// Mapping of a peer's type-UID space onto the local registry.
///
/// Negotiated at connect time: each side sends `(uid, name)` pairs for
/// its registered types, terminated by `-1`. A peer UID whose name is
/// unknown locally stays unresolved and fails the calls that use it.
#[derive(Debug, Default)]
pub struct RemoteTypes {
    by_remote: AHashMap<u16, Arc<TypeInfo>>,
}

impl RemoteTypes {
    /// Write the local type list for the peer.
    pub fn serialize_local_types(registry: &TypeRegistry, dst: &mut BytesMut) {
        for info in registry.all() {
            dst.put_i16(info.uid().0 as i16);
            write_string(info.name(), dst);
        }
        dst.put_i16(-1);
    }

    /// Read the peer's type list and resolve each entry against the
    /// local registry by name.
    pub fn deserialize(src: &mut Bytes, registry: &TypeRegistry) -> Result<RemoteTypes, WireError> {
        let mut by_remote = AHashMap::new();
        loop {
            ensure(src, 2)?;
            let uid = src.get_i16();
            if uid < 0 {
                break;
            }
            let name = read_string(src)?;
            match registry.lookup_name(&name) {
                Some(info) => {
                    by_remote.insert(uid as u16, info);
                }
                None => {
                    log::warn!("peer type '{name}' (uid {uid}) is unknown locally");
                }
            }
        }
        Ok(RemoteTypes { by_remote })
    }

    pub fn resolve(&self, remote_uid: u16) -> Option<Arc<TypeInfo>> {
        self.by_remote.get(&remote_uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_remote.is_empty()
    }
}
