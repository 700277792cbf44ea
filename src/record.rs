//! Declarative fixed-layout record codecs.
//!
//! Every on-disk struct in this crate (ELF headers, PE headers, resource
//! directory records, HFS+ overlays) is declared once through the [`layout!`]
//! macro, which generates the struct plus `SIZE`, `read_from` and `write_to`
//! from the field list. Hand-written per-field byte shuffling is the
//! historical source of struct-packing bugs in this kind of code, so no
//! struct in the crate decodes itself by hand.
//!
//! Little-endian is the default (ELF and PE engine templates are LE only);
//! the HFS+/Apple Partition Map overlays are big-endian on disk and use the
//! `be` form of the macro.

/// A fixed-width field that knows how to read and write itself at either
/// byte order. Implemented for the scalar widths the historical format
/// strings called `b`/`s`/`l`/`q`, plus inline byte arrays.
pub trait Scalar: Sized + Copy {
    const SIZE: usize;
    fn get_le(buf: &[u8]) -> Self;
    fn put_le(self, buf: &mut [u8]);
    fn get_be(buf: &[u8]) -> Self;
    fn put_be(self, buf: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($ty:ty),+) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                fn get_le(buf: &[u8]) -> Self {
                    Self::from_le_bytes(buf[..Self::SIZE].try_into().unwrap())
                }
                fn put_le(self, buf: &mut [u8]) {
                    buf[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
                fn get_be(buf: &[u8]) -> Self {
                    Self::from_be_bytes(buf[..Self::SIZE].try_into().unwrap())
                }
                fn put_be(self, buf: &mut [u8]) {
                    buf[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
                }
            }
        )+
    };
}

impl_scalar!(u8, u16, u32, u64);

/// Byte arrays are copied verbatim; byte order does not apply.
impl<const N: usize> Scalar for [u8; N] {
    const SIZE: usize = N;
    fn get_le(buf: &[u8]) -> Self {
        buf[..N].try_into().unwrap()
    }
    fn put_le(self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self);
    }
    fn get_be(buf: &[u8]) -> Self {
        Self::get_le(buf)
    }
    fn put_be(self, buf: &mut [u8]) {
        self.put_le(buf)
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __field_get {
    (le, $ty:ty, $buf:expr) => {
        <$ty as $crate::record::Scalar>::get_le($buf)
    };
    (be, $ty:ty, $buf:expr) => {
        <$ty as $crate::record::Scalar>::get_be($buf)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __field_put {
    (le, $ty:ty, $val:expr, $buf:expr) => {
        <$ty as $crate::record::Scalar>::put_le($val, $buf)
    };
    (be, $ty:ty, $val:expr, $buf:expr) => {
        <$ty as $crate::record::Scalar>::put_be($val, $buf)
    };
}

/// Declare an on-disk record: struct definition plus generated codec.
///
/// ```ignore
/// layout! {
///     le struct IconDirEntry {
///         pub width: u8,
///         pub height: u8,
///         ...
///     }
/// }
/// ```
#[macro_export]
macro_rules! layout {
    ($endian:ident $(#[$meta:meta])* struct $name:ident {
        $($(#[$fmeta:meta])* pub $field:ident : $ty:ty,)+
    }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ty,)+
        }

        impl $name {
            /// On-disk size of one record, in bytes.
            pub const SIZE: usize = 0 $(+ <$ty as $crate::record::Scalar>::SIZE)+;

            /// Decode one record from the front of `buf`.
            pub fn read_from(buf: &[u8]) -> $crate::error::DeployResult<Self> {
                if buf.len() < Self::SIZE {
                    return Err($crate::error::DeployError::Truncated(stringify!($name)));
                }
                let mut off = 0usize;
                $(
                    let $field = $crate::__field_get!($endian, $ty, &buf[off..]);
                    off += <$ty as $crate::record::Scalar>::SIZE;
                )+
                let _ = off;
                Ok(Self { $($field,)+ })
            }

            /// Encode this record over the front of `buf`.
            ///
            /// Panics if `buf` is shorter than [`Self::SIZE`]; callers size
            /// destination buffers from the layout constants.
            pub fn write_to(&self, buf: &mut [u8]) {
                assert!(buf.len() >= Self::SIZE);
                let mut off = 0usize;
                $(
                    $crate::__field_put!($endian, $ty, self.$field, &mut buf[off..]);
                    off += <$ty as $crate::record::Scalar>::SIZE;
                )+
                let _ = off;
            }

            /// Encode into a fresh buffer.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut out = vec![0u8; Self::SIZE];
                self.write_to(&mut out);
                out
            }
        }
    };
}

#[cfg(test)]
mod tests {
    layout! {
        le struct Sample {
            pub a: u8,
            pub b: u16,
            pub c: u32,
            pub d: u64,
            pub tag: [u8; 4],
        }
    }

    layout! {
        be struct BigSample {
            pub a: u16,
            pub b: u32,
        }
    }

    #[test]
    fn test_size_is_sum_of_fields() {
        assert_eq!(Sample::SIZE, 1 + 2 + 4 + 8 + 4);
        assert_eq!(BigSample::SIZE, 6);
    }

    #[test]
    fn test_round_trip_is_identity() {
        let s = Sample {
            a: 0x12,
            b: 0x3456,
            c: 0x789abcde,
            d: 0x0123456789abcdef,
            tag: *b"PE\0\0",
        };
        let bytes = s.to_bytes();
        assert_eq!(Sample::read_from(&bytes).unwrap(), s);
    }

    #[test]
    fn test_little_endian_order() {
        let s = Sample {
            a: 1,
            b: 0x0302,
            c: 0x07060504,
            d: 0x0f0e0d0c0b0a0908,
            tag: [0x10, 0x11, 0x12, 0x13],
        };
        let bytes = s.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..3], &[0x02, 0x03]);
        assert_eq!(&bytes[3..7], &[0x04, 0x05, 0x06, 0x07]);
    }

    #[test]
    fn test_big_endian_order() {
        let s = BigSample { a: 0x0102, b: 0x03040506 };
        let bytes = s.to_bytes();
        assert_eq!(bytes, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_truncated_read_fails() {
        let err = Sample::read_from(&[0u8; 4]).unwrap_err();
        assert!(err.to_string().contains("Sample"));
    }
}
