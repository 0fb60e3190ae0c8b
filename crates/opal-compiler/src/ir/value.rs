//! IR Values and Identifiers
//!
//! Newtype identifiers, static types, constants and operands used by the
//! instruction set.

use serde::Serialize;

/// Local variable identifier within a function body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LocalId(pub u32);

impl LocalId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Frame slot identifier, assigned by the slot allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Host function identifier in a module's host table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HostFuncId(pub u32);

impl HostFuncId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for HostFuncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host{}", self.0)
    }
}

/// Suspension point ordinal, assigned by the builder in emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SuspendId(pub u32);

impl SuspendId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SuspendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Structured region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Extracted cleanup routine identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CleanupId(pub u32);

impl CleanupId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CleanupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Static type of a local or frame slot
///
/// `Param` is an open type parameter of a generic suspendable function.
/// Slot compatibility compares `Ty` by equality, so a `Param` slot only
/// unifies with the same parameter index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Ty {
    Unit,
    Int,
    Bool,
    Str,
    /// Reference type with pointer identity
    Obj,
    /// Open type parameter of the enclosing function
    Param(u32),
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::Unit => write!(f, "unit"),
            Ty::Int => write!(f, "int"),
            Ty::Bool => write!(f, "bool"),
            Ty::Str => write!(f, "str"),
            Ty::Obj => write!(f, "obj"),
            Ty::Param(n) => write!(f, "T{}", n),
        }
    }
}

/// Compile-time constant
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Unit,
    Int(i64),
    Bool(bool),
    Str(String),
}

impl std::fmt::Display for Const {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Const::Unit => write!(f, "unit"),
            Const::Int(v) => write!(f, "{}", v),
            Const::Bool(v) => write!(f, "{}", v),
            Const::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// A storable location: a transient local or a persistent frame slot
///
/// `Slot` only appears in lowered bodies; the builder emits `Local`
/// places and the step synthesizer substitutes promoted locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Place {
    Local(LocalId),
    Slot(SlotId),
}

impl std::fmt::Display for Place {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Place::Local(l) => write!(f, "{}", l),
            Place::Slot(s) => write!(f, "{}", s),
        }
    }
}

/// Operand of an instruction or terminator
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Local(LocalId),
    Slot(SlotId),
    Const(Const),
}

impl Operand {
    pub fn unit() -> Self {
        Operand::Const(Const::Unit)
    }

    pub fn int(v: i64) -> Self {
        Operand::Const(Const::Int(v))
    }

    pub fn bool(v: bool) -> Self {
        Operand::Const(Const::Bool(v))
    }

    pub fn str(v: impl Into<String>) -> Self {
        Operand::Const(Const::Str(v.into()))
    }

    /// The local this operand reads, if any
    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            Operand::Local(l) => Some(*l),
            _ => None,
        }
    }
}

impl From<LocalId> for Operand {
    fn from(l: LocalId) -> Self {
        Operand::Local(l)
    }
}

impl From<Place> for Operand {
    fn from(p: Place) -> Self {
        match p {
            Place::Local(l) => Operand::Local(l),
            Place::Slot(s) => Operand::Slot(s),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Local(l) => write!(f, "{}", l),
            Operand::Slot(s) => write!(f, "{}", s),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

/// What kind of binding a local declaration is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    /// Declared parameter; `by_ref` parameters alias caller storage
    Param { by_ref: bool },
    /// The receiver of an instance suspendable function
    Receiver,
    /// Ordinary user-declared local
    Local,
    /// Compiler-introduced temporary (e.g. a spilled sub-expression)
    Temp,
}

impl LocalKind {
    pub fn is_param(&self) -> bool {
        matches!(self, LocalKind::Param { .. } | LocalKind::Receiver)
    }

    pub fn is_by_ref(&self) -> bool {
        matches!(
            self,
            LocalKind::Param { by_ref: true } | LocalKind::Receiver
        )
    }
}

/// Declaration of a local variable or parameter
#[derive(Debug, Clone)]
pub struct LocalDecl {
    /// Source name, if the local has one
    pub name: Option<String>,
    /// Static type
    pub ty: Ty,
    /// Binding kind
    pub kind: LocalKind,
    /// Address-sensitive local that must never cross a suspension point
    pub pinned: bool,
}

impl LocalDecl {
    pub fn new(name: Option<String>, ty: Ty, kind: LocalKind) -> Self {
        Self {
            name,
            ty,
            kind,
            pinned: false,
        }
    }

    /// Display name, falling back to the positional form
    pub fn display_name(&self, id: LocalId) -> String {
        self.name.clone().unwrap_or_else(|| format!("_{}", id.0))
    }
}
