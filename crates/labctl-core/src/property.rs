//! Property accessor tables
//!
//! Every driver exposes its instrument as a flat set of named properties.
//! The mapping from name to behaviour is plain data: a [`PropertyTable`] of
//! [`Accessor`]s, each holding a getter, an optional setter and the value
//! kind used to parse user input.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::FutureExt;
//! use labctl_core::property::{Accessor, PropertyKind, PropertyTable, PropertyValue};
//!
//! static PROPERTIES: LazyLock<PropertyTable<Stage>> = LazyLock::new(|| {
//!     PropertyTable::new(vec![
//!         Accessor::new("speed", "Maximum speed", PropertyKind::Int)
//!             .unit("%")
//!             .getter(|s: &Stage| async move { s.speed().await.map(PropertyValue::Int) }.boxed())
//!             .setter(|s: &Stage, v| async move { s.set_speed(v.as_int("speed")?).await.map(drop) }.boxed()),
//!     ])
//! });
//!
//! PROPERTIES.set_str(&stage, "speed", "250").await?; // clamped to 100
//! ```

use crate::error::{LabError, LabResult};
use futures::future::BoxFuture;
use std::fmt;

// =============================================================================
// PropertyValue
// =============================================================================

/// Dynamically typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// On/off state
    Bool(bool),
    /// Integer setting (speeds, counts, milliseconds)
    Int(i64),
    /// Measured or commanded quantity
    Float(f64),
    /// Free-form reply text
    Text(String),
    /// Multi-axis quantity (stage positions)
    Vector(Vec<f64>),
}

impl PropertyValue {
    /// Kind of this value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::Text(_) => PropertyKind::Text,
            PropertyValue::Vector(_) => PropertyKind::Vector,
        }
    }

    /// Convert to `kind` without losing information.
    ///
    /// `name` is only used for the error message.
    pub fn coerce(self, kind: PropertyKind, name: &str) -> LabResult<PropertyValue> {
        use PropertyValue as V;

        let value = match (kind, self) {
            (PropertyKind::Bool, V::Bool(b)) => V::Bool(b),
            (PropertyKind::Bool, V::Int(0)) => V::Bool(false),
            (PropertyKind::Bool, V::Int(1)) => V::Bool(true),
            (PropertyKind::Int, V::Int(i)) => V::Int(i),
            (PropertyKind::Int, V::Bool(b)) => V::Int(i64::from(b)),
            (PropertyKind::Int, V::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                V::Int(f as i64)
            }
            (PropertyKind::Float, V::Float(f)) => V::Float(f),
            (PropertyKind::Float, V::Int(i)) => V::Float(i as f64),
            (PropertyKind::Text, V::Text(s)) => V::Text(s),
            (PropertyKind::Vector, V::Vector(v)) => V::Vector(v),
            (PropertyKind::Vector, V::Float(f)) => V::Vector(vec![f]),
            (PropertyKind::Vector, V::Int(i)) => V::Vector(vec![i as f64]),
            (kind, other) => {
                return Err(LabError::InvalidValue {
                    name: name.to_string(),
                    message: format!("expected {}, got {}", kind, other.kind()),
                })
            }
        };
        Ok(value)
    }

    /// Boolean content, or `InvalidValue`.
    pub fn as_bool(&self, name: &str) -> LabResult<bool> {
        match self.clone().coerce(PropertyKind::Bool, name)? {
            PropertyValue::Bool(b) => Ok(b),
            _ => Err(mismatch(name, PropertyKind::Bool)),
        }
    }

    /// Integer content, or `InvalidValue`.
    pub fn as_int(&self, name: &str) -> LabResult<i64> {
        match self.clone().coerce(PropertyKind::Int, name)? {
            PropertyValue::Int(i) => Ok(i),
            _ => Err(mismatch(name, PropertyKind::Int)),
        }
    }

    /// Floating-point content, or `InvalidValue`.
    pub fn as_float(&self, name: &str) -> LabResult<f64> {
        match self.clone().coerce(PropertyKind::Float, name)? {
            PropertyValue::Float(f) => Ok(f),
            _ => Err(mismatch(name, PropertyKind::Float)),
        }
    }

    /// Vector content, or `InvalidValue`.
    pub fn as_vector(&self, name: &str) -> LabResult<Vec<f64>> {
        match self.clone().coerce(PropertyKind::Vector, name)? {
            PropertyValue::Vector(v) => Ok(v),
            _ => Err(mismatch(name, PropertyKind::Vector)),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<Vec<f64>> for PropertyValue {
    fn from(v: Vec<f64>) -> Self {
        PropertyValue::Vector(v)
    }
}

impl From<[f64; 3]> for PropertyValue {
    fn from(v: [f64; 3]) -> Self {
        PropertyValue::Vector(v.to_vec())
    }
}

/// `None` is the "no reading" sentinel and becomes empty text.
impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => PropertyValue::Text(String::new()),
        }
    }
}

fn mismatch(name: &str, kind: PropertyKind) -> LabError {
    LabError::InvalidValue {
        name: name.to_string(),
        message: format!("expected {}", kind),
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::Text(s) => write!(f, "{}", s),
            PropertyValue::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

// =============================================================================
// PropertyKind
// =============================================================================

/// Value kind of an accessor, used to parse textual input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// `true/false`, `on/off`, `yes/no`, `1/0`
    Bool,
    /// Decimal integer
    Int,
    /// Decimal floating point
    Float,
    /// Anything
    Text,
    /// Comma or whitespace separated numbers, optionally in brackets
    Vector,
}

impl PropertyKind {
    /// Parse user input into a value of this kind.
    pub fn parse(self, name: &str, input: &str) -> LabResult<PropertyValue> {
        let trimmed = input.trim();
        let invalid = |message: String| LabError::InvalidValue {
            name: name.to_string(),
            message,
        };

        match self {
            PropertyKind::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(PropertyValue::Bool(true)),
                "0" | "false" | "off" | "no" => Ok(PropertyValue::Bool(false)),
                _ => Err(invalid(format!("'{}' is not a boolean", trimmed))),
            },
            PropertyKind::Int => trimmed
                .parse::<i64>()
                .map(PropertyValue::Int)
                .map_err(|e| invalid(format!("'{}': {}", trimmed, e))),
            PropertyKind::Float => trimmed
                .parse::<f64>()
                .map(PropertyValue::Float)
                .map_err(|e| invalid(format!("'{}': {}", trimmed, e))),
            PropertyKind::Text => Ok(PropertyValue::Text(input.to_string())),
            PropertyKind::Vector => {
                let inner = trimmed.trim_start_matches('[').trim_end_matches(']');
                let values = inner
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<f64>()
                            .map_err(|e| invalid(format!("'{}': {}", s, e)))
                    })
                    .collect::<LabResult<Vec<f64>>>()?;
                if values.is_empty() {
                    return Err(invalid("empty vector".to_string()));
                }
                Ok(PropertyValue::Vector(values))
            }
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyKind::Bool => "bool",
            PropertyKind::Int => "int",
            PropertyKind::Float => "float",
            PropertyKind::Text => "text",
            PropertyKind::Vector => "vector",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Accessor
// =============================================================================

/// Read a property from a driver.
pub type Getter<D> = for<'a> fn(&'a D) -> BoxFuture<'a, LabResult<PropertyValue>>;

/// Write a property to a driver. The value has already been coerced to the
/// accessor's kind.
pub type Setter<D> = for<'a> fn(&'a D, PropertyValue) -> BoxFuture<'a, LabResult<()>>;

/// One named property of a driver.
pub struct Accessor<D> {
    name: &'static str,
    description: &'static str,
    unit: Option<&'static str>,
    kind: PropertyKind,
    get: Option<Getter<D>>,
    set: Option<Setter<D>>,
}

impl<D> fmt::Debug for Accessor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("readable", &self.get.is_some())
            .field("writable", &self.set.is_some())
            .finish()
    }
}

impl<D> Accessor<D> {
    /// Accessor with no getter or setter yet.
    pub fn new(name: &'static str, description: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            description,
            unit: None,
            kind,
            get: None,
            set: None,
        }
    }

    /// Physical units.
    pub fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Attach the getter.
    pub fn getter(mut self, get: Getter<D>) -> Self {
        self.get = Some(get);
        self
    }

    /// Attach the setter.
    pub fn setter(mut self, set: Setter<D>) -> Self {
        self.set = Some(set);
        self
    }

    /// Property name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Static description of this accessor.
    pub fn info(&self) -> PropertyInfo {
        PropertyInfo {
            name: self.name,
            description: self.description,
            unit: self.unit,
            kind: self.kind,
            readable: self.get.is_some(),
            writable: self.set.is_some(),
        }
    }
}

/// Introspection record for one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property name
    pub name: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// Physical units
    pub unit: Option<&'static str>,
    /// Value kind
    pub kind: PropertyKind,
    /// Has a getter
    pub readable: bool,
    /// Has a setter
    pub writable: bool,
}

// =============================================================================
// PropertyTable
// =============================================================================

/// Name-to-accessor mapping for one driver type.
pub struct PropertyTable<D> {
    accessors: Vec<Accessor<D>>,
}

impl<D> fmt::Debug for PropertyTable<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.accessors).finish()
    }
}

impl<D> PropertyTable<D> {
    /// Build a table. Names are matched exactly, in declaration order.
    pub fn new(accessors: Vec<Accessor<D>>) -> Self {
        Self { accessors }
    }

    /// Look up an accessor by name.
    pub fn accessor(&self, name: &str) -> LabResult<&Accessor<D>> {
        self.accessors
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| LabError::UnknownProperty(name.to_string()))
    }

    /// All property names in declaration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.accessors.iter().map(|a| a.name).collect()
    }

    /// Introspection records for every property.
    pub fn describe(&self) -> Vec<PropertyInfo> {
        self.accessors.iter().map(Accessor::info).collect()
    }

    /// Read `name` from `driver`.
    pub async fn get(&self, driver: &D, name: &str) -> LabResult<PropertyValue> {
        let accessor = self.accessor(name)?;
        match accessor.get {
            Some(get) => get(driver).await,
            None => Err(LabError::InvalidValue {
                name: name.to_string(),
                message: "property is write-only".to_string(),
            }),
        }
    }

    /// Write `value` to `name` on `driver`, coercing it to the accessor's kind.
    pub async fn set(&self, driver: &D, name: &str, value: PropertyValue) -> LabResult<()> {
        let accessor = self.accessor(name)?;
        let set = accessor
            .set
            .ok_or_else(|| LabError::ReadOnlyProperty(name.to_string()))?;
        let value = value.coerce(accessor.kind, name)?;
        set(driver, value).await
    }

    /// Parse `input` by the accessor's kind and write it.
    pub async fn set_str(&self, driver: &D, name: &str, input: &str) -> LabResult<()> {
        let accessor = self.accessor(name)?;
        if accessor.set.is_none() {
            return Err(LabError::ReadOnlyProperty(name.to_string()));
        }
        let value = accessor.kind.parse(name, input)?;
        self.set(driver, name, value).await
    }

    /// Read every readable property. Individual failures are kept in place.
    pub async fn snapshot(&self, driver: &D) -> Vec<(&'static str, LabResult<PropertyValue>)> {
        let mut values = Vec::with_capacity(self.accessors.len());
        for accessor in &self.accessors {
            if let Some(get) = accessor.get {
                values.push((accessor.name, get(driver).await));
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Default)]
    struct Dial {
        value: AtomicI64,
    }

    fn table() -> PropertyTable<Dial> {
        PropertyTable::new(vec![
            Accessor::new("value", "Dial position", PropertyKind::Int)
                .unit("%")
                .getter(|d: &Dial| {
                    async move { Ok(PropertyValue::Int(d.value.load(Ordering::SeqCst))) }.boxed()
                })
                .setter(|d: &Dial, v| {
                    async move {
                        d.value.store(v.as_int("value")?, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                }),
            Accessor::new("label", "Fixed label", PropertyKind::Text)
                .getter(|_: &Dial| async move { Ok(PropertyValue::Text("dial".into())) }.boxed()),
        ])
    }

    #[tokio::test]
    async fn test_get_and_set() {
        let table = table();
        let dial = Dial::default();
        table.set(&dial, "value", PropertyValue::Int(5)).await.unwrap();
        assert_eq!(table.get(&dial, "value").await.unwrap(), PropertyValue::Int(5));
    }

    #[tokio::test]
    async fn test_set_str_parses_by_kind() {
        let table = table();
        let dial = Dial::default();
        table.set_str(&dial, "value", " 42 ").await.unwrap();
        assert_eq!(dial.value.load(Ordering::SeqCst), 42);

        let err = table.set_str(&dial, "value", "fast").await.unwrap_err();
        assert!(matches!(err, LabError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_unknown_and_read_only() {
        let table = table();
        let dial = Dial::default();
        assert!(matches!(
            table.get(&dial, "nope").await,
            Err(LabError::UnknownProperty(_))
        ));
        assert!(matches!(
            table.set_str(&dial, "label", "x").await,
            Err(LabError::ReadOnlyProperty(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_and_describe() {
        let table = table();
        let dial = Dial::default();
        let snapshot = table.snapshot(&dial).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(table.names(), vec!["value", "label"]);

        let info = table.describe();
        assert!(info[0].writable);
        assert!(!info[1].writable);
        assert_eq!(info[0].unit, Some("%"));
    }

    #[test]
    fn test_coercion() {
        assert_eq!(
            PropertyValue::Int(3).coerce(PropertyKind::Float, "x").unwrap(),
            PropertyValue::Float(3.0)
        );
        assert_eq!(
            PropertyValue::Float(4.0).coerce(PropertyKind::Int, "x").unwrap(),
            PropertyValue::Int(4)
        );
        assert!(PropertyValue::Float(4.5).coerce(PropertyKind::Int, "x").is_err());
        assert!(PropertyValue::Int(2).coerce(PropertyKind::Bool, "x").is_err());
        assert_eq!(
            PropertyValue::Float(1.5).coerce(PropertyKind::Vector, "x").unwrap(),
            PropertyValue::Vector(vec![1.5])
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            PropertyKind::Bool.parse("enabled", "ON").unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            PropertyKind::Vector.parse("position", "[1, -2 3.5]").unwrap(),
            PropertyValue::Vector(vec![1.0, -2.0, 3.5])
        );
        assert!(PropertyKind::Vector.parse("position", "[]").is_err());
        assert_eq!(PropertyValue::Vector(vec![1.0, 2.5]).to_string(), "[1, 2.5]");
    }

    #[test]
    fn test_missing_reading_is_empty_text() {
        assert_eq!(PropertyValue::from(Some(21.5)), PropertyValue::Float(21.5));
        assert_eq!(
            PropertyValue::from(None::<i64>),
            PropertyValue::Text(String::new())
        );
    }
}
