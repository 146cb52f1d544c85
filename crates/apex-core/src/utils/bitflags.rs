// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `apex_bitflags!` macro, used for usage masks and color write masks.

/// Declares a transparent bitflag set over an unsigned integer.
///
/// The generated type is `Copy`, hashable, and supports the usual set operators
/// (`|`, `&`, `!`, `|=`). Its `Debug` output lists the named flags it contains.
#[macro_export]
#[doc(hidden)]
macro_rules! apex_bitflags {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $(
                $(#[$flag_attr:meta])*
                const $flag_name:ident = $flag_value:expr;
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        $vis struct $name {
            bits: $ty,
        }

        impl $name {
            /// The set containing no flags.
            pub const EMPTY: Self = Self { bits: 0 };

            $(
                $(#[$flag_attr])*
                pub const $flag_name: Self = Self { bits: $flag_value };
            )*

            /// Builds a set from raw bits. Unknown bits are preserved.
            pub const fn from_bits_truncate(bits: $ty) -> Self {
                Self { bits }
            }

            /// Returns the raw bits.
            pub const fn bits(&self) -> $ty {
                self.bits
            }

            /// Returns `true` when no bit is set.
            pub const fn is_empty(&self) -> bool {
                self.bits == 0
            }

            /// Returns `true` when every flag of `other` is set in `self`.
            pub const fn contains(&self, other: Self) -> bool {
                (self.bits & other.bits) == other.bits
            }

            /// Returns `true` when `self` and `other` share at least one flag.
            pub const fn intersects(&self, other: Self) -> bool {
                (self.bits & other.bits) != 0
            }

            /// Sets the flags of `other`.
            pub fn insert(&mut self, other: Self) {
                self.bits |= other.bits;
            }

            /// Clears the flags of `other`.
            pub fn remove(&mut self, other: Self) {
                self.bits &= !other.bits;
            }

            /// Sets or clears the flags of `other` depending on `value`.
            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                Self { bits: self.bits | other.bits }
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, other: Self) -> Self {
                Self { bits: self.bits & other.bits }
            }
        }

        impl core::ops::Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self { bits: !self.bits }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, other: Self) {
                self.bits |= other.bits;
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                let mut remaining = self.bits;
                let mut names: Vec<&'static str> = Vec::new();
                $(
                    if $flag_value != 0 && (remaining & $flag_value) == $flag_value {
                        names.push(stringify!($flag_name));
                        remaining &= !$flag_value;
                    }
                )*
                write!(f, "{}(", stringify!($name))?;
                if names.is_empty() && remaining == 0 {
                    write!(f, "EMPTY")?;
                } else {
                    write!(f, "{}", names.join(" | "))?;
                    if remaining != 0 {
                        if !names.is_empty() {
                            write!(f, " | ")?;
                        }
                        write!(f, "{:#x}", remaining)?;
                    }
                }
                write!(f, ")")
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::apex_bitflags;

    apex_bitflags! {
        /// Channels of a render target, for macro verification.
        pub struct Channels: u8 {
            const RED = 1 << 0;
            const GREEN = 1 << 1;
            const BLUE = 1 << 2;
            const ALPHA = 1 << 3;
            const COLOR = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
        }
    }

    #[test]
    fn empty_set_is_default() {
        assert_eq!(Channels::default(), Channels::EMPTY);
        assert!(Channels::EMPTY.is_empty());
        assert_eq!(format!("{:?}", Channels::EMPTY), "Channels(EMPTY)");
    }

    #[test]
    fn composite_flag_contains_its_parts() {
        assert!(Channels::COLOR.contains(Channels::RED | Channels::BLUE));
        assert!(!Channels::COLOR.contains(Channels::ALPHA));
        assert!(Channels::COLOR.intersects(Channels::GREEN | Channels::ALPHA));
    }

    #[test]
    fn set_toggles_by_value() {
        let mut mask = Channels::COLOR;
        mask.set(Channels::ALPHA, true);
        assert_eq!(mask.bits(), 0b1111);
        mask.set(Channels::GREEN, false);
        assert_eq!(mask.bits(), 0b1101);
    }

    #[test]
    fn debug_lists_flags_and_reports_unknown_bits() {
        assert_eq!(
            format!("{:?}", Channels::COLOR),
            "Channels(RED | GREEN | BLUE)"
        );
        let raw = Channels::from_bits_truncate(0b1_0001);
        assert_eq!(format!("{:?}", raw), "Channels(RED | 0x10)");
    }

    #[test]
    fn operators_match_raw_bit_math() {
        let a = Channels::RED | Channels::GREEN;
        let b = Channels::GREEN | Channels::ALPHA;
        assert_eq!((a & b).bits(), Channels::GREEN.bits());
        assert_eq!((!Channels::EMPTY).bits(), u8::MAX);
        let mut c = Channels::EMPTY;
        c |= Channels::BLUE;
        assert_eq!(c, Channels::BLUE);
    }
}
