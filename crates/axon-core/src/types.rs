//! The runtime type registry.
//!
//! Every type that flows through a port is registered here once and
//! identified by a dense 16-bit UID afterwards. The registry records
//! enough about each type to create buffers for it (factory), to ship
//! it over the wire (payload codec via [`PortValue`]), and to pair it
//! with an implicitly defined list type. Method (interface) types
//! carry the set of methods they expose instead of a factory.

use std::any::TypeId;
use std::fmt::Debug;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use downcast_rs::{impl_downcast, DowncastSync};
use parking_lot::RwLock;

/// Numeric identifier of a registered type. Dense, process-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeUid(pub u16);

/// UIDs below this value are reserved for cheap-copy types.
pub const CHEAP_COPY_UID_LIMIT: u16 = 200;

/// An error while encoding or decoding a wire payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("wire payload is truncated")]
    Truncated,
    #[error("unknown type uid {0}")]
    UnknownTypeUid(u16),
    #[error("invalid wire tag {0}")]
    InvalidTag(u8),
    #[error("string payload is not valid utf-8")]
    InvalidString,
}

/// An error while parsing a value from a configuration literal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to parse value literal '{literal}': {reason}")]
pub struct ParseValueError {
    pub literal: String,
    pub reason: String,
}

/// A value that can live inside a port buffer.
///
/// Concrete data-type crates implement this for their payloads; the
/// runtime core only needs copy assignment, the wire codec, and the
/// configuration-literal parser.
pub trait PortValue: DowncastSync + Debug {
    /// Copy-assign from another value of the same concrete type.
    ///
    /// Mismatched concrete types are a programming error upstream
    /// (connections are type-checked); implementations may panic.
    fn assign_from(&mut self, other: &dyn PortValue);

    /// Append this value's wire payload to `dst`.
    fn encode(&self, dst: &mut BytesMut);

    /// Replace this value with the payload read from `src`.
    fn decode(&mut self, src: &mut Bytes) -> Result<(), WireError>;

    /// Parse this value from a configuration literal.
    fn parse_assign(&mut self, text: &str) -> Result<(), ParseValueError>;

    /// Best-effort value equality across trait objects.
    fn eq_value(&self, other: &dyn PortValue) -> bool;
}

impl_downcast!(sync PortValue);

/// Payload types usable with [`SimpleValue`].
pub trait WirePayload:
    Clone + Debug + Default + PartialEq + Send + Sync + FromStr + 'static
{
    fn write(&self, dst: &mut BytesMut);
    fn read(src: &mut Bytes) -> Result<Self, WireError>;
}

macro_rules! numeric_wire_payload {
    ($ty:ty, $put:ident, $get:ident, $width:expr) => {
        impl WirePayload for $ty {
            fn write(&self, dst: &mut BytesMut) {
                dst.$put(*self);
            }

            fn read(src: &mut Bytes) -> Result<Self, WireError> {
                if src.remaining() < $width {
                    return Err(WireError::Truncated);
                }
                Ok(src.$get())
            }
        }
    };
}

numeric_wire_payload!(i16, put_i16, get_i16, 2);
numeric_wire_payload!(i32, put_i32, get_i32, 4);
numeric_wire_payload!(i64, put_i64, get_i64, 8);
numeric_wire_payload!(f32, put_f32, get_f32, 4);
numeric_wire_payload!(f64, put_f64, get_f64, 8);

impl WirePayload for bool {
    fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(*self as u8);
    }

    fn read(src: &mut Bytes) -> Result<Self, WireError> {
        if src.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        Ok(src.get_u8() != 0)
    }
}

impl WirePayload for String {
    fn write(&self, dst: &mut BytesMut) {
        dst.put_u16(self.len() as u16);
        dst.put_slice(self.as_bytes());
    }

    fn read(src: &mut Bytes) -> Result<Self, WireError> {
        if src.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let len = src.get_u16() as usize;
        if src.remaining() < len {
            return Err(WireError::Truncated);
        }
        let raw = src.copy_to_bytes(len);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidString)
    }
}

/// The standard [`PortValue`] implementation wrapping a plain payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimpleValue<T>(pub T);

impl<T> PortValue for SimpleValue<T>
where
    T: WirePayload,
    <T as FromStr>::Err: Display,
{
    fn assign_from(&mut self, other: &dyn PortValue) {
        let other = other
            .downcast_ref::<SimpleValue<T>>()
            .expect("assign_from across different concrete types");
        self.0 = other.0.clone();
    }

    fn encode(&self, dst: &mut BytesMut) {
        self.0.write(dst);
    }

    fn decode(&mut self, src: &mut Bytes) -> Result<(), WireError> {
        self.0 = T::read(src)?;
        Ok(())
    }

    fn parse_assign(&mut self, text: &str) -> Result<(), ParseValueError> {
        match text.trim().parse::<T>() {
            Ok(v) => {
                self.0 = v;
                Ok(())
            }
            Err(e) => Err(ParseValueError {
                literal: text.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn eq_value(&self, other: &dyn PortValue) -> bool {
        other
            .downcast_ref::<SimpleValue<T>>()
            .map(|o| o.0 == self.0)
            .unwrap_or(false)
    }
}

/// Factory creating a fresh value buffer payload. The flag requests an
/// inter-thread variant (relevant for cheap-copy hand-off containers).
pub type ValueFactory = dyn Fn(bool) -> Box<dyn PortValue> + Send + Sync;

/// Broad classification of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Fixed-size, trivially copyable; handled by thread-local pools.
    CheapCopy,
    /// Heap buffers, reference-counted.
    Standard,
    /// List of another registered type.
    List { element: TypeUid },
    /// RPC port interface; carries methods instead of a factory.
    Method,
}

/// One method of a [`PortInterface`].
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub index: u8,
    /// Number of parameter cells the method takes (0..=4).
    pub arity: u8,
    pub has_return: bool,
    /// Handle this method on an RPC worker thread instead of the
    /// caller's thread.
    pub handle_in_extra_thread: bool,
    pub default_net_timeout: Duration,
}

/// The set of methods a method (interface) type exposes.
#[derive(Debug, Clone, Default)]
pub struct PortInterface {
    methods: Vec<MethodInfo>,
}

impl PortInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method. Its index must be the next free one.
    pub fn add_method(&mut self, method: MethodInfo) {
        assert_eq!(
            method.index as usize,
            self.methods.len(),
            "method indices must be dense"
        );
        self.methods.push(method);
    }

    pub fn method(&self, index: u8) -> Option<&MethodInfo> {
        self.methods.get(index as usize)
    }

    pub fn method_by_name(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
}

/// Descriptor of one registered type.
pub struct TypeInfo {
    uid: TypeUid,
    name: String,
    kind: TypeKind,
    /// Size of the value in bytes (0 if unknown).
    size: usize,
    /// Offset of the virtual table inside the value (0 if trivially
    /// copyable). `size - vtable_offset` is the memcpy-safe size.
    vtable_offset: usize,
    factory: Option<Box<ValueFactory>>,
    native: Option<TypeId>,
    list_type: OnceLock<TypeUid>,
    /// Opaque process-local tag. Never serialized.
    custom_tag: AtomicI32,
    interface: Option<PortInterface>,
}

impl Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}

impl TypeInfo {
    pub fn uid(&self) -> TypeUid {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn memcpy_size(&self) -> usize {
        self.size - self.vtable_offset
    }

    pub fn is_cheap_copy(&self) -> bool {
        matches!(self.kind, TypeKind::CheapCopy)
    }

    pub fn is_method_type(&self) -> bool {
        matches!(self.kind, TypeKind::Method)
    }

    pub fn interface(&self) -> Option<&PortInterface> {
        self.interface.as_ref()
    }

    pub fn custom_tag(&self) -> i32 {
        self.custom_tag.load(Ordering::Relaxed)
    }

    pub fn set_custom_tag(&self, tag: i32) {
        self.custom_tag.store(tag, Ordering::Relaxed);
    }

    /// Create a fresh value instance, or `None` if the type has no
    /// factory (list and method types).
    pub fn create_instance(&self, inter_thread: bool) -> Option<Box<dyn PortValue>> {
        self.factory.as_ref().map(|f| f(inter_thread))
    }
}

/// Parameters for [`TypeRegistry::get_or_register`].
pub struct TypeRegistration {
    pub name: String,
    pub kind: TypeKind,
    pub size: usize,
    pub vtable_offset: usize,
    pub factory: Option<Box<ValueFactory>>,
    pub native: Option<TypeId>,
    /// Force a specific UID. Registering two distinct native types
    /// under the same UID aborts the process.
    pub explicit_uid: Option<u16>,
    pub interface: Option<PortInterface>,
}

struct RegistryInner {
    slots: Vec<Option<Arc<TypeInfo>>>,
    by_name: AHashMap<String, TypeUid>,
    by_native: AHashMap<TypeId, TypeUid>,
    next_cheap: u16,
    next_standard: u16,
}

/// Process-wide table of registered types, dense by UID.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

static GLOBAL_REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();

impl TypeRegistry {
    fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                slots: Vec::new(),
                by_name: AHashMap::new(),
                by_native: AHashMap::new(),
                next_cheap: 0,
                next_standard: CHEAP_COPY_UID_LIMIT,
            }),
        }
    }

    /// The process-wide registry. Initialized on first access and kept
    /// alive past the last buffer pool.
    pub fn global() -> &'static TypeRegistry {
        GLOBAL_REGISTRY.get_or_init(TypeRegistry::new)
    }

    /// Register a type, or return the existing descriptor when the
    /// same native type was registered before.
    pub fn get_or_register(&self, reg: TypeRegistration) -> Arc<TypeInfo> {
        let mut inner = self.inner.write();

        if let Some(native) = reg.native {
            if let Some(&uid) = inner.by_native.get(&native) {
                return inner.slots[uid.0 as usize]
                    .as_ref()
                    .expect("native index points at empty slot")
                    .clone();
            }
        } else if let Some(&uid) = inner.by_name.get(&reg.name) {
            // Types without a native id (method and list types) are
            // idempotent per name.
            return inner.slots[uid.0 as usize]
                .as_ref()
                .expect("name index points at empty slot")
                .clone();
        }

        let uid = match reg.explicit_uid {
            Some(uid) => {
                if let Some(existing) = inner.slots.get(uid as usize).and_then(|s| s.as_ref()) {
                    if existing.native != reg.native || existing.name != reg.name {
                        panic!(
                            "type uid {} already registered as '{}', refusing '{}'",
                            uid, existing.name, reg.name
                        );
                    }
                    return existing.clone();
                }
                uid
            }
            None => match reg.kind {
                TypeKind::CheapCopy => {
                    let uid = inner.next_cheap;
                    assert!(
                        uid < CHEAP_COPY_UID_LIMIT,
                        "cheap-copy type uid space exhausted"
                    );
                    inner.next_cheap += 1;
                    uid
                }
                _ => {
                    let uid = inner.next_standard;
                    inner.next_standard = inner
                        .next_standard
                        .checked_add(1)
                        .expect("type uid space exhausted");
                    uid
                }
            },
        };

        let info = Arc::new(TypeInfo {
            uid: TypeUid(uid),
            name: reg.name.clone(),
            kind: reg.kind,
            size: reg.size,
            vtable_offset: reg.vtable_offset,
            factory: reg.factory,
            native: reg.native,
            list_type: OnceLock::new(),
            custom_tag: AtomicI32::new(0),
            interface: reg.interface,
        });

        if inner.slots.len() <= uid as usize {
            inner.slots.resize(uid as usize + 1, None);
        }
        inner.slots[uid as usize] = Some(info.clone());
        inner.by_name.insert(reg.name, TypeUid(uid));
        if let Some(native) = reg.native {
            inner.by_native.insert(native, TypeUid(uid));
        }

        log::debug!("registered type '{}' as uid {}", info.name, uid);

        info
    }

    /// Convenience registration of a [`SimpleValue`] payload type.
    pub fn register_value<T>(&self, name: &str, cheap_copy: bool) -> Arc<TypeInfo>
    where
        T: WirePayload,
        <T as FromStr>::Err: Display,
    {
        self.get_or_register(TypeRegistration {
            name: name.to_string(),
            kind: if cheap_copy {
                TypeKind::CheapCopy
            } else {
                TypeKind::Standard
            },
            size: std::mem::size_of::<T>(),
            vtable_offset: 0,
            factory: Some(Box::new(|_inter_thread| {
                Box::new(SimpleValue(T::default())) as Box<dyn PortValue>
            })),
            native: Some(TypeId::of::<SimpleValue<T>>()),
            explicit_uid: None,
            interface: None,
        })
    }

    /// Register a method (interface) type.
    pub fn register_method_type(&self, name: &str, interface: PortInterface) -> Arc<TypeInfo> {
        self.get_or_register(TypeRegistration {
            name: name.to_string(),
            kind: TypeKind::Method,
            size: 0,
            vtable_offset: 0,
            factory: None,
            native: None,
            explicit_uid: None,
            interface: Some(interface),
        })
    }

    /// Snapshot of all registered types, in UID order.
    pub fn all(&self) -> Vec<Arc<TypeInfo>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(|s| s.clone())
            .collect()
    }

    pub fn lookup_uid(&self, uid: TypeUid) -> Option<Arc<TypeInfo>> {
        self.inner
            .read()
            .slots
            .get(uid.0 as usize)
            .and_then(|s| s.clone())
    }

    pub fn lookup_name(&self, name: &str) -> Option<Arc<TypeInfo>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .and_then(|&uid| inner.slots[uid.0 as usize].clone())
    }

    pub fn lookup_native(&self, native: TypeId) -> Option<Arc<TypeInfo>> {
        let inner = self.inner.read();
        inner
            .by_native
            .get(&native)
            .and_then(|&uid| inner.slots[uid.0 as usize].clone())
    }

    /// Create a fresh value instance of the given type.
    pub fn create_instance(&self, uid: TypeUid, inter_thread: bool) -> Option<Box<dyn PortValue>> {
        self.lookup_uid(uid)?.create_instance(inter_thread)
    }

    /// The paired list type of a standard or cheap-copy type, created
    /// on first use.
    pub fn list_type_of(&self, uid: TypeUid) -> Option<Arc<TypeInfo>> {
        let element = self.lookup_uid(uid)?;
        match element.kind {
            TypeKind::CheapCopy | TypeKind::Standard => {}
            _ => return None,
        }
        if let Some(&list_uid) = element.list_type.get() {
            return self.lookup_uid(list_uid);
        }
        let list = self.get_or_register(TypeRegistration {
            name: format!("List<{}>", element.name),
            kind: TypeKind::List { element: uid },
            size: 0,
            vtable_offset: 0,
            factory: None,
            native: None,
            explicit_uid: None,
            interface: None,
        });
        let _ = element.list_type.set(list.uid);
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_per_native_type() {
        let reg = TypeRegistry::new();
        let a = reg.register_value::<i64>("Int64", true);
        let b = reg.register_value::<i64>("Int64", true);
        assert_eq!(a.uid(), b.uid());
        assert!(a.uid().0 < CHEAP_COPY_UID_LIMIT);
    }

    #[test]
    fn standard_types_allocate_above_cheap_copy_space() {
        let reg = TypeRegistry::new();
        let s = reg.register_value::<String>("String", false);
        assert!(s.uid().0 >= CHEAP_COPY_UID_LIMIT);
        assert_eq!(reg.lookup_name("String").unwrap().uid(), s.uid());
        assert!(reg.lookup_name("NoSuchType").is_none());
    }

    #[test]
    fn list_type_is_created_on_first_use() {
        let reg = TypeRegistry::new();
        let e = reg.register_value::<f64>("Double", true);
        let l1 = reg.list_type_of(e.uid()).unwrap();
        let l2 = reg.list_type_of(e.uid()).unwrap();
        assert_eq!(l1.uid(), l2.uid());
        assert_eq!(l1.name(), "List<Double>");
        assert!(matches!(l1.kind(), TypeKind::List { element } if element == e.uid()));
    }

    #[test]
    fn instances_round_trip_through_the_wire_codec() {
        let reg = TypeRegistry::new();
        let t = reg.register_value::<i32>("Int32", true);
        let mut v = reg.create_instance(t.uid(), false).unwrap();
        v.downcast_mut::<SimpleValue<i32>>().unwrap().0 = 1234;

        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        let mut copy = reg.create_instance(t.uid(), false).unwrap();
        copy.decode(&mut buf.freeze()).unwrap();
        assert!(v.eq_value(&*copy));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut v = SimpleValue(0i64);
        let mut short = Bytes::from_static(&[0, 1, 2]);
        assert_eq!(v.decode(&mut short), Err(WireError::Truncated));
    }

    #[test]
    fn parse_assign_follows_fromstr() {
        let mut v = SimpleValue(0i64);
        v.parse_assign("42").unwrap();
        assert_eq!(v.0, 42);
        assert!(v.parse_assign("not a number").is_err());
    }
}
