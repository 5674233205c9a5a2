//! The type-system collaborator: classes, fields, methods and vtables.
//!
//! The execution engine only consumes this through lookups, layout queries
//! and [`Metadata::resolve_virtual`]. A [`Metadata`] is immutable once built
//! by [`MetadataBuilder`].

mod builder;

pub use builder::{EXCEPTION_MESSAGE_FIELD, MetadataBuilder, MethodDef};

use std::collections::HashMap;
use std::fmt;

use crate::il::MethodBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// A type as it appears in signatures, locals and instruction operands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Void,
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native int
    I,
    /// Native unsigned int
    U,
    String,
    Object,
    /// A class or value type
    Class(ClassId),
    /// Single-dimension, zero-based array
    Array(Box<TypeDesc>),
    /// Managed pointer
    ByRef(Box<TypeDesc>),
    /// Unmanaged pointer
    Ptr(Box<TypeDesc>),
    /// Method generic parameter
    MVar(u16),
}

impl TypeDesc {
    pub fn array(elem: TypeDesc) -> Self {
        TypeDesc::Array(Box::new(elem))
    }

    pub fn by_ref(inner: TypeDesc) -> Self {
        TypeDesc::ByRef(Box::new(inner))
    }

    /// Substitute method generic parameters.
    pub fn inflate(&self, ctx: &GenericContext) -> TypeDesc {
        match self {
            TypeDesc::MVar(n) => ctx
                .method_inst
                .get(*n as usize)
                .cloned()
                .unwrap_or(TypeDesc::MVar(*n)),
            TypeDesc::Array(t) => TypeDesc::Array(Box::new(t.inflate(ctx))),
            TypeDesc::ByRef(t) => TypeDesc::ByRef(Box::new(t.inflate(ctx))),
            TypeDesc::Ptr(t) => TypeDesc::Ptr(Box::new(t.inflate(ctx))),
            other => other.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            TypeDesc::MVar(_) => true,
            TypeDesc::Array(t) | TypeDesc::ByRef(t) | TypeDesc::Ptr(t) => t.is_open(),
            _ => false,
        }
    }

    fn primitive_name(&self) -> Option<&'static str> {
        Some(match self {
            TypeDesc::Void => "void",
            TypeDesc::Bool => "bool",
            TypeDesc::Char => "char",
            TypeDesc::I1 => "i1",
            TypeDesc::U1 => "u1",
            TypeDesc::I2 => "i2",
            TypeDesc::U2 => "u2",
            TypeDesc::I4 => "i4",
            TypeDesc::U4 => "u4",
            TypeDesc::I8 => "i8",
            TypeDesc::U8 => "u8",
            TypeDesc::R4 => "r4",
            TypeDesc::R8 => "r8",
            TypeDesc::I => "i",
            TypeDesc::U => "u",
            TypeDesc::String => "string",
            TypeDesc::Object => "object",
            _ => return None,
        })
    }

    /// Parse the textual form used by program files: primitive keywords,
    /// class names, `T[]`, `T&`, `T*` and `!!N`.
    pub fn parse(
        text: &str,
        lookup_class: &dyn Fn(&str) -> Option<ClassId>,
    ) -> Result<TypeDesc, String> {
        let text = text.trim();
        if let Some(inner) = text.strip_suffix("[]") {
            return Ok(TypeDesc::array(TypeDesc::parse(inner, lookup_class)?));
        }
        if let Some(inner) = text.strip_suffix('&') {
            return Ok(TypeDesc::by_ref(TypeDesc::parse(inner, lookup_class)?));
        }
        if let Some(inner) = text.strip_suffix('*') {
            return Ok(TypeDesc::Ptr(Box::new(TypeDesc::parse(inner, lookup_class)?)));
        }
        if let Some(n) = text.strip_prefix("!!") {
            return n
                .parse()
                .map(TypeDesc::MVar)
                .map_err(|_| format!("bad generic parameter `{text}`"));
        }
        Ok(match text {
            "void" => TypeDesc::Void,
            "bool" => TypeDesc::Bool,
            "char" => TypeDesc::Char,
            "i1" => TypeDesc::I1,
            "u1" => TypeDesc::U1,
            "i2" => TypeDesc::I2,
            "u2" => TypeDesc::U2,
            "i4" => TypeDesc::I4,
            "u4" => TypeDesc::U4,
            "i8" => TypeDesc::I8,
            "u8" => TypeDesc::U8,
            "r4" => TypeDesc::R4,
            "r8" => TypeDesc::R8,
            "i" => TypeDesc::I,
            "u" => TypeDesc::U,
            "string" => TypeDesc::String,
            "object" => TypeDesc::Object,
            name => TypeDesc::Class(lookup_class(name).ok_or_else(|| name.to_string())?),
        })
    }
}

/// Method-level generic instantiation in effect while compiling a body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GenericContext {
    pub method_inst: Vec<TypeDesc>,
}

impl GenericContext {
    pub fn new(method_inst: Vec<TypeDesc>) -> Self {
        Self { method_inst }
    }

    pub fn is_empty(&self) -> bool {
        self.method_inst.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub has_this: bool,
    pub params: Vec<TypeDesc>,
    pub ret: TypeDesc,
}

impl Signature {
    pub fn inflate(&self, ctx: &GenericContext) -> Signature {
        Signature {
            has_this: self.has_this,
            params: self.params.iter().map(|p| p.inflate(ctx)).collect(),
            ret: self.ret.inflate(ctx),
        }
    }

    /// Number of argument slots including `this`.
    pub fn arg_count(&self) -> usize {
        self.params.len() + self.has_this as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_final: bool,
    pub is_abstract: bool,
    pub is_newslot: bool,
}

/// How a method is implemented.
#[derive(Clone)]
pub enum MethodImpl {
    Il(MethodBody),
    /// Host function registered with the runtime under this name
    InternalCall(String),
    /// Foreign function looked up by symbol
    PInvoke { library: String, symbol: String },
    /// Externally compiled code entered through the native-call bridge
    #[cfg(feature = "jit")]
    Compiled(crate::jit::CompiledEntry),
    Abstract,
}

impl fmt::Debug for MethodImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodImpl::Il(body) => write!(f, "Il({} instrs)", body.code.len()),
            MethodImpl::InternalCall(name) => write!(f, "InternalCall({name})"),
            MethodImpl::PInvoke { library, symbol } => write!(f, "PInvoke({library}!{symbol})"),
            #[cfg(feature = "jit")]
            MethodImpl::Compiled(entry) => write!(f, "Compiled({:p})", *entry as *const ()),
            MethodImpl::Abstract => write!(f, "Abstract"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassDesc {
    pub name: String,
    pub parent: Option<ClassId>,
    pub is_value_type: bool,
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    pub vtable: Vec<MethodId>,
    /// Bytes of instance data (value size for value types)
    pub instance_size: u32,
    pub static_size: u32,
    /// Underlying primitive of the boxed form of a primitive type
    pub primitive: Option<TypeDesc>,
}

#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub owner: ClassId,
    pub ty: TypeDesc,
    pub is_static: bool,
    /// Byte offset within instance data or the static block
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub name: String,
    pub owner: ClassId,
    pub sig: Signature,
    pub flags: MethodFlags,
    pub generic_params: u16,
    pub imp: MethodImpl,
    pub slot: Option<u16>,
}

/// Classes seeded by [`MetadataBuilder::new`], in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WellKnown {
    Object,
    ValueType,
    String,
    Array,
    Exception,
    ArithmeticException,
    DivideByZeroException,
    OverflowException,
    NullReferenceException,
    IndexOutOfRangeException,
    InvalidCastException,
    ArrayTypeMismatchException,
    StackOverflowException,
    ThreadInterruptedException,
    MissingMethodException,
    ExecutionEngineException,
    OutOfMemoryException,
    Console,
    Boolean,
    Char,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    IntPtr,
    UIntPtr,
}

impl WellKnown {
    pub fn id(self) -> ClassId {
        ClassId(self as u32)
    }
}

/// Immutable type system.
#[derive(Debug, Clone)]
pub struct Metadata {
    classes: Vec<ClassDesc>,
    fields: Vec<FieldDesc>,
    methods: Vec<MethodDesc>,
    by_name: HashMap<String, ClassId>,
}

impl Metadata {
    pub fn class(&self, id: ClassId) -> &ClassDesc {
        &self.classes[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &FieldDesc {
        &self.fields[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &MethodDesc {
        &self.methods[id.0 as usize]
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Look up `Class::name`, optionally with a parameter list such as
    /// `Class::name(i4, string)` to pick an overload.
    pub fn find_method(&self, spec: &str) -> Option<MethodId> {
        let (class, name, params) = split_member_spec(spec)?;
        let class = self.find_class(class)?;
        let params = match params {
            Some(list) => Some(
                list.iter()
                    .map(|p| TypeDesc::parse(p, &|n| self.find_class(n)).ok())
                    .collect::<Option<Vec<_>>>()?,
            ),
            None => None,
        };
        self.class(class).methods.iter().copied().find(|&m| {
            let desc = self.method(m);
            desc.name == name && params.as_ref().is_none_or(|p| *p == desc.sig.params)
        })
    }

    pub fn find_field(&self, spec: &str) -> Option<FieldId> {
        let (class, name, _) = split_member_spec(spec)?;
        let mut class = Some(self.find_class(class)?);
        while let Some(c) = class {
            let desc = self.class(c);
            if let Some(f) = desc.fields.iter().copied().find(|&f| self.field(f).name == name) {
                return Some(f);
            }
            class = desc.parent;
        }
        None
    }

    pub fn well_known(&self, which: WellKnown) -> ClassId {
        which.id()
    }

    /// `Class::name` of a method.
    pub fn method_name(&self, id: MethodId) -> String {
        let m = self.method(id);
        format!("{}::{}", self.class(m.owner).name, m.name)
    }

    pub fn type_name(&self, ty: &TypeDesc) -> String {
        if let Some(name) = ty.primitive_name() {
            return name.to_string();
        }
        match ty {
            TypeDesc::Class(c) => self.class(*c).name.clone(),
            TypeDesc::Array(t) => format!("{}[]", self.type_name(t)),
            TypeDesc::ByRef(t) => format!("{}&", self.type_name(t)),
            TypeDesc::Ptr(t) => format!("{}*", self.type_name(t)),
            TypeDesc::MVar(n) => format!("!!{n}"),
            _ => unreachable!("primitive names handled above"),
        }
    }

    pub fn is_subclass_of(&self, class: ClassId, base: ClassId) -> bool {
        let mut cur = Some(class);
        while let Some(c) = cur {
            if c == base {
                return true;
            }
            cur = self.class(c).parent;
        }
        false
    }

    /// The override of `method` that an instance of `class` runs.
    pub fn resolve_virtual(&self, method: MethodId, class: ClassId) -> MethodId {
        match self.method(method).slot {
            Some(slot) => self
                .class(class)
                .vtable
                .get(slot as usize)
                .copied()
                .unwrap_or(method),
            None => method,
        }
    }

    pub fn is_value_type(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::Class(c) if self.class(*c).is_value_type)
    }

    /// Class of the boxed form of a primitive or value type.
    pub fn box_class(&self, ty: &TypeDesc) -> Option<ClassId> {
        let which = match ty {
            TypeDesc::Bool => WellKnown::Boolean,
            TypeDesc::Char => WellKnown::Char,
            TypeDesc::I1 => WellKnown::SByte,
            TypeDesc::U1 => WellKnown::Byte,
            TypeDesc::I2 => WellKnown::Int16,
            TypeDesc::U2 => WellKnown::UInt16,
            TypeDesc::I4 => WellKnown::Int32,
            TypeDesc::U4 => WellKnown::UInt32,
            TypeDesc::I8 => WellKnown::Int64,
            TypeDesc::U8 => WellKnown::UInt64,
            TypeDesc::R4 => WellKnown::Single,
            TypeDesc::R8 => WellKnown::Double,
            TypeDesc::I => WellKnown::IntPtr,
            TypeDesc::U => WellKnown::UIntPtr,
            TypeDesc::Class(c) if self.class(*c).is_value_type => return Some(*c),
            _ => return None,
        };
        Some(which.id())
    }

    /// Storage size of a value of `ty` inside an object, array or static block.
    pub fn size_of(&self, ty: &TypeDesc) -> u32 {
        match ty {
            TypeDesc::Void => 0,
            TypeDesc::Bool | TypeDesc::I1 | TypeDesc::U1 => 1,
            TypeDesc::Char | TypeDesc::I2 | TypeDesc::U2 => 2,
            TypeDesc::I4 | TypeDesc::U4 | TypeDesc::R4 => 4,
            TypeDesc::Class(c) if self.class(*c).is_value_type => self.class(*c).instance_size,
            _ => 8,
        }
    }

    pub fn align_of(&self, ty: &TypeDesc) -> u32 {
        if self.is_value_type(ty) {
            8
        } else {
            self.size_of(ty).clamp(1, 8)
        }
    }

    /// Size of `ty` in a frame slot or on the value-type stack.
    pub fn slot_size(&self, ty: &TypeDesc) -> u32 {
        align8(self.size_of(ty).max(1))
    }

    /// Whether an object of class `class` can be stored where `target` is
    /// expected.
    pub fn class_is_assignable(&self, class: ClassId, target: &TypeDesc) -> bool {
        match target {
            TypeDesc::Object => true,
            TypeDesc::String => class == WellKnown::String.id(),
            TypeDesc::Class(t) => self.is_subclass_of(class, *t),
            other => self.box_class(other) == Some(class),
        }
    }
}

pub(crate) fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

/// Split `Class::name(params)` into its parts. Generic arguments in angle
/// brackets are not part of the member spec.
pub(crate) fn split_member_spec(spec: &str) -> Option<(&str, &str, Option<Vec<&str>>)> {
    let (head, params) = match spec.find('(') {
        Some(open) => {
            let close = spec.rfind(')')?;
            let inner = spec[open + 1..close].trim();
            let list = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(str::trim).collect()
            };
            (&spec[..open], Some(list))
        }
        None => (spec, None),
    };
    let (class, name) = head.trim().rsplit_once("::")?;
    Some((class, name, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{Instr, MethodBody};

    fn sample() -> (Metadata, ClassId, ClassId, MethodId, MethodId) {
        let mut b = MetadataBuilder::new();
        let base = b.define_class("Shape", None).unwrap();
        let derived = b.define_class("Square", Some(base)).unwrap();
        let ret_body = MethodBody {
            code: vec![Instr::LdcI4(0), Instr::Ret],
            ..Default::default()
        };
        let area = b.add_method(base, MethodDef::instance("Area", vec![], TypeDesc::I4).virtual_());
        b.set_body(area, ret_body.clone());
        let over = b.add_method(derived, MethodDef::instance("Area", vec![], TypeDesc::I4).virtual_());
        b.set_body(over, ret_body);
        (b.finish().unwrap(), base, derived, area, over)
    }

    #[test]
    fn test_vtable_override() {
        let (md, base, derived, area, over) = sample();
        assert_eq!(md.resolve_virtual(area, derived), over);
        assert_eq!(md.resolve_virtual(area, base), area);
        assert_eq!(md.method(area).slot, md.method(over).slot);
    }

    #[test]
    fn test_subclass() {
        let (md, base, derived, ..) = sample();
        assert!(md.is_subclass_of(derived, base));
        assert!(!md.is_subclass_of(base, derived));
        assert!(md.is_subclass_of(derived, WellKnown::Object.id()));
    }

    #[test]
    fn test_find_method_with_overload() {
        let (md, ..) = sample();
        let w1 = md.find_method("System.Console::WriteLine(i4)").unwrap();
        let w2 = md.find_method("System.Console::WriteLine(string)").unwrap();
        assert_ne!(w1, w2);
        assert_eq!(md.method(w2).sig.params, vec![TypeDesc::String]);
        assert!(md.find_method("Square::Area").is_some());
    }

    #[test]
    fn test_type_parse() {
        let (md, base, ..) = sample();
        let lookup = |n: &str| md.find_class(n);
        assert_eq!(
            TypeDesc::parse("Shape[]", &lookup).unwrap(),
            TypeDesc::array(TypeDesc::Class(base))
        );
        assert_eq!(
            TypeDesc::parse("i4&", &lookup).unwrap(),
            TypeDesc::by_ref(TypeDesc::I4)
        );
        assert_eq!(TypeDesc::parse("!!1", &lookup).unwrap(), TypeDesc::MVar(1));
        assert!(TypeDesc::parse("Nope", &lookup).is_err());
    }

    #[test]
    fn test_inflate() {
        let ctx = GenericContext::new(vec![TypeDesc::I8]);
        assert_eq!(
            TypeDesc::array(TypeDesc::MVar(0)).inflate(&ctx),
            TypeDesc::array(TypeDesc::I8)
        );
    }

    #[test]
    fn test_split_member_spec() {
        assert_eq!(
            split_member_spec("A.B::.ctor(i4, string)"),
            Some(("A.B", ".ctor", Some(vec!["i4", "string"])))
        );
        assert_eq!(split_member_spec("A::f"), Some(("A", "f", None)));
        assert_eq!(split_member_spec("nope"), None);
    }
}
