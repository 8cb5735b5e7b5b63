//! The 64-bit tagged encoding of every RDF term the engine touches.
//!
//! The top four bits carry a [`Datatype`] tag, the remaining 60 bits the
//! payload. The total order compares tags first (so every datatype occupies
//! one contiguous section of the id space and `Undefined` sorts strictly
//! below everything else) and interprets the payload per tag within a
//! section.

use std::cmp::Ordering;
use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Number of payload bits in a [`ValueId`].
pub const PAYLOAD_BITS: u32 = 60;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

/// Largest integer representable inline (60-bit two's complement).
pub const MAX_INT: i64 = (1 << (PAYLOAD_BITS - 1)) - 1;
pub const MIN_INT: i64 = -(1 << (PAYLOAD_BITS - 1));

const COORDINATE_BITS: u32 = 30;
const COORDINATE_MAX: u64 = (1 << COORDINATE_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Datatype {
    Undefined = 0,
    Bool = 1,
    Int = 2,
    Double = 3,
    Date = 4,
    GeoPoint = 5,
    VocabIndex = 6,
    LocalVocabIndex = 7,
    TextRecordIndex = 8,
    BlankNodeIndex = 9,
}

impl Datatype {
    pub fn from_tag(tag: u8) -> Option<Datatype> {
        use Datatype::*;
        Some(match tag {
            0 => Undefined,
            1 => Bool,
            2 => Int,
            3 => Double,
            4 => Date,
            5 => GeoPoint,
            6 => VocabIndex,
            7 => LocalVocabIndex,
            8 => TextRecordIndex,
            9 => BlankNodeIndex,
            _ => return None,
        })
    }

    /// Whether ids of this datatype compare numerically with ids of the
    /// other numeric datatype.
    pub fn is_numeric(self) -> bool {
        matches!(self, Datatype::Int | Datatype::Double)
    }
}

/// A calendar date with time-of-day, packed monotonically into 44 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateValue {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

const YEAR_BITS: u32 = 18;
const YEAR_OFFSET: i64 = 1 << (YEAR_BITS - 1);

impl DateValue {
    fn pack(self) -> u64 {
        let year = (self.year as i64 + YEAR_OFFSET) as u64;
        debug_assert!(year < (1 << YEAR_BITS));
        year << 26
            | (self.month as u64) << 22
            | (self.day as u64) << 17
            | (self.hour as u64) << 12
            | (self.minute as u64) << 6
            | self.second as u64
    }

    fn unpack(payload: u64) -> DateValue {
        DateValue {
            year: ((payload >> 26) as i64 - YEAR_OFFSET) as i32,
            month: (payload >> 22 & 0xf) as u8,
            day: (payload >> 17 & 0x1f) as u8,
            hour: (payload >> 12 & 0x1f) as u8,
            minute: (payload >> 6 & 0x3f) as u8,
            second: (payload & 0x3f) as u8,
        }
    }
}

/// Fixed-width tagged encoding of one RDF term.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ValueId(u64);

impl ValueId {
    /// The padding identity for outer joins; sorts below every other id.
    pub const UNDEFINED: ValueId = ValueId(0);

    /// Sorts at or above every constructible id; a search bound, never a
    /// value.
    pub const MAX: ValueId =
        ValueId((Datatype::BlankNodeIndex as u64) << PAYLOAD_BITS | PAYLOAD_MASK);

    fn new(datatype: Datatype, payload: u64) -> ValueId {
        debug_assert!(payload <= PAYLOAD_MASK);
        ValueId((datatype as u64) << PAYLOAD_BITS | payload)
    }

    pub fn datatype(self) -> Datatype {
        let tag = (self.0 >> PAYLOAD_BITS) as u8;
        Datatype::from_tag(tag).expect("a ValueId was constructed with an invalid datatype tag")
    }

    pub fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Re-checks the tag; the only safe way to adopt an id from raw bytes
    /// that did not come from one of our own files.
    pub fn from_bits(bits: u64) -> Option<ValueId> {
        Datatype::from_tag((bits >> PAYLOAD_BITS) as u8).map(|_| ValueId(bits))
    }

    pub fn is_undefined(self) -> bool {
        self == ValueId::UNDEFINED
    }

    pub fn from_bool(value: bool) -> ValueId {
        ValueId::new(Datatype::Bool, value as u64)
    }

    pub fn as_bool(self) -> Option<bool> {
        (self.datatype() == Datatype::Bool).then(|| self.payload() != 0)
    }

    /// Stores 60-bit two's complement; values outside the range saturate.
    pub fn from_int(value: i64) -> ValueId {
        let clamped = value.clamp(MIN_INT, MAX_INT);
        ValueId::new(Datatype::Int, (clamped as u64) & PAYLOAD_MASK)
    }

    pub fn as_int(self) -> Option<i64> {
        (self.datatype() == Datatype::Int).then(|| ((self.payload() << 4) as i64) >> 4)
    }

    /// Drops the four low mantissa bits; everything else round-trips.
    pub fn from_double(value: f64) -> ValueId {
        ValueId::new(Datatype::Double, value.to_bits() >> 4)
    }

    pub fn as_double(self) -> Option<f64> {
        (self.datatype() == Datatype::Double).then(|| f64::from_bits(self.payload() << 4))
    }

    /// The numeric value of an `Int` or `Double` id.
    pub fn as_numeric(self) -> Option<f64> {
        match self.datatype() {
            Datatype::Int => self.as_int().map(|i| i as f64),
            Datatype::Double => self.as_double(),
            _ => None,
        }
    }

    pub fn from_date(date: DateValue) -> ValueId {
        ValueId::new(Datatype::Date, date.pack())
    }

    pub fn as_date(self) -> Option<DateValue> {
        (self.datatype() == Datatype::Date).then(|| DateValue::unpack(self.payload()))
    }

    /// Packs a WGS84 coordinate pair at 30 bits per axis, latitude major.
    pub fn from_geo_point(lat: f64, lng: f64) -> ValueId {
        let lat = encode_coordinate(lat, -90.0, 90.0);
        let lng = encode_coordinate(lng, -180.0, 180.0);
        ValueId::new(Datatype::GeoPoint, lat << COORDINATE_BITS | lng)
    }

    pub fn as_geo_point(self) -> Option<(f64, f64)> {
        (self.datatype() == Datatype::GeoPoint).then(|| {
            let payload = self.payload();
            let lat = decode_coordinate(payload >> COORDINATE_BITS, -90.0, 90.0);
            let lng = decode_coordinate(payload & COORDINATE_MAX, -180.0, 180.0);
            (lat, lng)
        })
    }

    pub fn from_vocab_index(index: u64) -> ValueId {
        ValueId::new(Datatype::VocabIndex, index)
    }

    pub fn as_vocab_index(self) -> Option<u64> {
        (self.datatype() == Datatype::VocabIndex).then(|| self.payload())
    }

    /// A local-vocab id addresses `(chunk, word within chunk)`; chunk ids
    /// are unique per process, so published ids stay valid across merges.
    pub fn from_local_vocab_index(chunk: u32, word: u32) -> ValueId {
        debug_assert!((chunk as u64) < (1 << 28));
        ValueId::new(Datatype::LocalVocabIndex, (chunk as u64) << 32 | word as u64)
    }

    pub fn as_local_vocab_index(self) -> Option<(u32, u32)> {
        (self.datatype() == Datatype::LocalVocabIndex)
            .then(|| ((self.payload() >> 32) as u32, self.payload() as u32))
    }

    pub fn from_text_record_index(index: u64) -> ValueId {
        ValueId::new(Datatype::TextRecordIndex, index)
    }

    pub fn as_text_record_index(self) -> Option<u64> {
        (self.datatype() == Datatype::TextRecordIndex).then(|| self.payload())
    }

    pub fn from_blank_node_index(index: u64) -> ValueId {
        ValueId::new(Datatype::BlankNodeIndex, index)
    }

    pub fn as_blank_node_index(self) -> Option<u64> {
        (self.datatype() == Datatype::BlankNodeIndex).then(|| self.payload())
    }

    /// A `u64` whose unsigned order equals the id order, so byte-wise
    /// big-endian comparison (as done by external sorters) sorts ids
    /// correctly.
    pub fn order_key(self) -> u64 {
        let tag = self.0 & !PAYLOAD_MASK;
        let payload = match self.datatype() {
            Datatype::Int => (self.as_int().unwrap() - MIN_INT) as u64,
            Datatype::Double => {
                let bits = self.as_double().unwrap().to_bits();
                // The usual total-order trick: flip everything for
                // negatives, flip the sign for positives.
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                ordered >> 4
            }
            _ => self.payload(),
        };
        tag | payload
    }
}

fn encode_coordinate(value: f64, min: f64, max: f64) -> u64 {
    let clamped = value.clamp(min, max);
    (((clamped - min) / (max - min)) * COORDINATE_MAX as f64).round() as u64
}

fn decode_coordinate(bits: u64, min: f64, max: f64) -> f64 {
    min + (bits as f64 / COORDINATE_MAX as f64) * (max - min)
}

impl Ord for ValueId {
    fn cmp(&self, other: &Self) -> Ordering {
        let datatype = self.datatype();
        datatype.cmp(&other.datatype()).then_with(|| match datatype {
            Datatype::Int => self.as_int().unwrap().cmp(&other.as_int().unwrap()),
            Datatype::Double => self.as_double().unwrap().total_cmp(&other.as_double().unwrap()),
            _ => self.payload().cmp(&other.payload()),
        })
    }
}

impl PartialOrd for ValueId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.datatype() {
            Datatype::Undefined => write!(f, "Undefined"),
            Datatype::Bool => write!(f, "Bool({})", self.as_bool().unwrap()),
            Datatype::Int => write!(f, "Int({})", self.as_int().unwrap()),
            Datatype::Double => write!(f, "Double({})", self.as_double().unwrap()),
            Datatype::Date => write!(f, "Date({:?})", self.as_date().unwrap()),
            Datatype::GeoPoint => {
                let (lat, lng) = self.as_geo_point().unwrap();
                write!(f, "GeoPoint({lat:.6}, {lng:.6})")
            }
            Datatype::VocabIndex => write!(f, "V({})", self.payload()),
            Datatype::LocalVocabIndex => {
                let (chunk, word) = self.as_local_vocab_index().unwrap();
                write!(f, "L({chunk}:{word})")
            }
            Datatype::TextRecordIndex => write!(f, "T({})", self.payload()),
            Datatype::BlankNodeIndex => write!(f, "B({})", self.payload()),
        }
    }
}

/// The six relational operators of the prefilter and expression algebras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    LessThan,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    GreaterThan,
}

impl Comparison {
    /// The operator describing the complement set of rows, used by the
    /// prefilter's De-Morgan rewrite.
    pub fn complement(self) -> Comparison {
        use Comparison::*;
        match self {
            LessThan => GreaterEqual,
            LessEqual => GreaterThan,
            Equal => NotEqual,
            NotEqual => Equal,
            GreaterEqual => LessThan,
            GreaterThan => LessEqual,
        }
    }

    /// The operator with its arguments swapped: `a < b` iff `b > a`.
    pub fn reversed(self) -> Comparison {
        use Comparison::*;
        match self {
            LessThan => GreaterThan,
            LessEqual => GreaterEqual,
            Equal => Equal,
            NotEqual => NotEqual,
            GreaterEqual => LessEqual,
            GreaterThan => LessThan,
        }
    }

    pub fn matches(self, ordering: Ordering) -> bool {
        use Comparison::*;
        match self {
            LessThan => ordering == Ordering::Less,
            LessEqual => ordering != Ordering::Greater,
            Equal => ordering == Ordering::Equal,
            NotEqual => ordering != Ordering::Equal,
            GreaterEqual => ordering != Ordering::Less,
            GreaterThan => ordering == Ordering::Greater,
        }
    }

    pub fn as_str(self) -> &'static str {
        use Comparison::*;
        match self {
            LessThan => "<",
            LessEqual => "<=",
            Equal => "=",
            NotEqual => "!=",
            GreaterEqual => ">=",
            GreaterThan => ">",
        }
    }
}

/// Compares two ids the way the expression evaluator does: numerically
/// across the `Int`/`Double` boundary, by the id order everywhere else.
/// Comparisons involving `Undefined` yield `None`.
pub fn compare_ids(a: ValueId, b: ValueId) -> Option<Ordering> {
    if a.is_undefined() || b.is_undefined() {
        return None;
    }
    match (a.as_numeric(), b.as_numeric()) {
        (Some(x), Some(y)) => Some(x.total_cmp(&y)),
        _ => Some(a.cmp(&b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip_and_order() {
        for value in [0i64, 1, -1, 42, -4321, MAX_INT, MIN_INT] {
            assert_eq!(ValueId::from_int(value).as_int(), Some(value));
        }
        assert!(ValueId::from_int(-5) < ValueId::from_int(3));
        assert!(ValueId::from_int(MIN_INT) < ValueId::from_int(MAX_INT));
        // Out-of-range values saturate.
        assert_eq!(ValueId::from_int(i64::MAX).as_int(), Some(MAX_INT));
    }

    #[test]
    fn double_roundtrip_and_order() {
        let pi = ValueId::from_double(3.14).as_double().unwrap();
        assert!((pi - 3.14).abs() < 1e-12);
        assert!(ValueId::from_double(-2.5) < ValueId::from_double(-1.0));
        assert!(ValueId::from_double(-1.0) < ValueId::from_double(0.0));
        assert!(ValueId::from_double(0.0) < ValueId::from_double(1.5));
    }

    #[test]
    fn undefined_sorts_below_everything() {
        let others = [
            ValueId::from_bool(false),
            ValueId::from_int(MIN_INT),
            ValueId::from_double(f64::NEG_INFINITY),
            ValueId::from_vocab_index(0),
        ];
        for other in others {
            assert!(ValueId::UNDEFINED < other);
        }
    }

    #[test]
    fn datatype_sections_are_contiguous() {
        let int = ValueId::from_int(i64::MAX);
        let double = ValueId::from_double(f64::NEG_INFINITY);
        // Every int sorts below every double, whatever the numeric values.
        assert!(int < double);
    }

    #[test]
    fn date_packing_is_monotone() {
        let earlier =
            DateValue { year: 2023, month: 12, day: 31, hour: 23, minute: 59, second: 59 };
        let later = DateValue { year: 2024, month: 1, day: 1, hour: 0, minute: 0, second: 0 };
        assert!(ValueId::from_date(earlier) < ValueId::from_date(later));
        assert_eq!(ValueId::from_date(earlier).as_date(), Some(earlier));
        let bc = DateValue { year: -44, month: 3, day: 15, hour: 12, minute: 0, second: 0 };
        assert_eq!(ValueId::from_date(bc).as_date(), Some(bc));
        assert!(ValueId::from_date(bc) < ValueId::from_date(earlier));
    }

    #[test]
    fn geo_point_roundtrip() {
        let id = ValueId::from_geo_point(48.8584, 2.2945);
        let (lat, lng) = id.as_geo_point().unwrap();
        assert!((lat - 48.8584).abs() < 1e-6);
        assert!((lng - 2.2945).abs() < 1e-6);
    }

    #[test]
    fn local_vocab_index_roundtrip() {
        let id = ValueId::from_local_vocab_index(7, 123_456);
        assert_eq!(id.as_local_vocab_index(), Some((7, 123_456)));
    }

    #[test]
    fn cross_type_numeric_comparison() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_ids(ValueId::from_int(2), ValueId::from_double(2.5)), Some(Less));
        assert_eq!(compare_ids(ValueId::from_double(2.0), ValueId::from_int(2)), Some(Equal));
        assert_eq!(compare_ids(ValueId::UNDEFINED, ValueId::from_int(0)), None);
    }

    #[test]
    fn order_key_is_monotone() {
        let ids = [
            ValueId::UNDEFINED,
            ValueId::from_bool(false),
            ValueId::from_bool(true),
            ValueId::from_int(MIN_INT),
            ValueId::from_int(-7),
            ValueId::from_int(0),
            ValueId::from_int(42),
            ValueId::from_int(MAX_INT),
            ValueId::from_double(f64::NEG_INFINITY),
            ValueId::from_double(-1.5),
            ValueId::from_double(-0.0),
            ValueId::from_double(0.25),
            ValueId::from_double(f64::INFINITY),
            ValueId::from_vocab_index(0),
            ValueId::from_vocab_index(99),
        ];
        for pair in ids.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} {:?}", pair[0], pair[1]);
            assert!(
                pair[0].order_key() <= pair[1].order_key(),
                "order key not monotone between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn comparison_complement_is_involutive() {
        use Comparison::*;
        for op in [LessThan, LessEqual, Equal, NotEqual, GreaterEqual, GreaterThan] {
            assert_eq!(op.complement().complement(), op);
        }
    }
}
