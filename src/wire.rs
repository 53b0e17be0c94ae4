// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Integer-coded enums.
//!
//! Manifests identify commands, parameters and algorithms with small CBOR
//! integers, and persistent storage identifies record kinds with 32-bit magic
//! words. Both are represented as C-like enums implementing [`WireEnum`],
//! usually generated with [`wire_enum!`].

use core::fmt;

/// Represents a C-like enum that can be converted to and from an integer
/// representation as well as to and from a string representation.
///
/// An implementation of this trait can be thought of as an integer with a
/// limited range: every enum variant can be converted to the wire format and
/// back, though not every value of the wire representation can be converted
/// into an enum variant.
///
/// In particular the following identity must hold for all types T:
/// ```
/// # use suit_core::wire::WireEnum;
/// # fn test<T: WireEnum + Copy + PartialEq + std::fmt::Debug>(x: T) {
/// assert_eq!(T::from_wire_value(T::to_wire_value(x)), Some(x));
/// # }
/// ```
pub trait WireEnum: Sized + Copy {
    /// The underlying "wire type", some kind of integer.
    type Wire;

    /// Converts `self` into its underlying wire representation.
    fn to_wire_value(self) -> Self::Wire;

    /// Attempts to parse a value of `Self` from the underlying wire
    /// representation.
    fn from_wire_value(wire: Self::Wire) -> Option<Self>;

    /// Converts `self` into a string representation.
    fn name(self) -> &'static str;

    /// Attempts to convert a value of `Self` from a string representation.
    fn from_name(str: &str) -> Option<Self>;
}

/// A deserialization-from-string error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WireEnumFromStrError;

impl fmt::Display for WireEnumFromStrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown variant")
    }
}

/// A convenience macro for generating `WireEnum`-implementing enums.
///
/// Syntax is as follows:
/// ```text
/// wire_enum! {
///     /// This is my enum.
///     pub enum MyEnum : i32 {
///         /// Variant `A`.
///         A = 0x00,
///         /// Variant `B`.
///         B = -16,
///     }
/// }
/// ```
/// This macro will generate an implementation of `WireEnum<Wire=i32>` for
/// the above enum. Values must be literals, since they are also used as
/// match patterns.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident : $wire:ident {
        $($(#[$meta_variant:meta])* $variant:ident = $value:literal,)*
    }) => {
        $(#[$meta])*
        #[repr($wire)]
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        $vis enum $name {
           $(
               $(#[$meta_variant])*
               $variant = $value,
           )*
        }

        impl $crate::wire::WireEnum for $name {
            type Wire = $wire;
            fn to_wire_value(self) -> Self::Wire {
                self as $wire
            }

            fn from_wire_value(wire: Self::Wire) -> Option<Self> {
                match wire {
                    $(
                        $value => Some(Self::$variant),
                    )*
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(
                        Self::$variant => stringify!($variant),
                    )*
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(
                        stringify!($variant) => Some(Self::$variant),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                use $crate::wire::WireEnum;

                write!(f, "{}", self.name())
            }
        }

        impl core::str::FromStr for $name {
            type Err = $crate::wire::WireEnumFromStrError;

            fn from_str(
                s: &str
            ) -> core::result::Result<Self, $crate::wire::WireEnumFromStrError> {
                use $crate::wire::WireEnum;

                $name::from_name(s).ok_or($crate::wire::WireEnumFromStrError)
            }
        }
    }
}
