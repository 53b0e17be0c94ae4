// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// Test-only macro for writing (potentially invalid!) CBOR by hand.
///
/// ```text
/// raw_cbor! {
///   // Any single-token expression implementing AsRef<[u8]> is copied as-is.
///   payload
///
///   // Hex-encoded bytes; whitespace is ignored.
///   h"a1 01 02"
///
///   // A text string, with its header.
///   t"hello"
///
///   // Minimal encoding of `value` with major type `ty`.
///   ty:value
///
///   // Minimal encoding of the byte length of `tokens`, then the tokens.
///   // `2 { ... }` is how bstr-wrapped CBOR is written.
///   ty { tokens }
///
///   // Minimal encoding of the number of comma-separated token groups, then
///   // the groups. A trailing comma is allowed. For maps, each group is a
///   // key followed by its value.
///   ty [ tokens, tokens ]
///
///   // Any of the above with the argument forced to `len` bytes.
///   ty@len:value
///   ty@len { tokens }
///   ty@len [ tokens ]
/// }
/// ```
macro_rules! raw_cbor {
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)? {$($tt:tt)*} $($rest:tt)*) => {{
        let inner = raw_cbor!($($tt)*);
        raw_cbor!(@parse[$out, None] $ty$(@$len)?:(inner.len() as u64));
        $out.extend_from_slice(&inner);
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)? [] $($rest:tt)*) => {{
        raw_cbor!(@parse[$out, None] $ty$(@$len)?:0);
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)? [$($tt:tt)*] $($rest:tt)*) => {{
        let mut inner = Vec::<u8>::new();
        let mut groups = 1;
        raw_cbor!(@parse[inner, (Some(&mut groups))] $($tt)*);
        raw_cbor!(@parse[$out, None] $ty$(@$len)?:groups);
        $out.extend_from_slice(&inner);
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)?:$arg:tt $($rest:tt)*) => {{
        let major: u8 = $ty;
        assert!(major < 8, "bad major type {}", major);
        let head = major << 5;
        let arg: u64 = $arg;

        #[allow(unused_mut)]
        let mut width: Option<u8> = None;
        $(width = Some($len);)?
        let width = width.unwrap_or(match arg {
            0..=23 => 0,
            24..=0xff => 1,
            0x100..=0xffff => 2,
            0x1_0000..=0xffff_ffff => 4,
            _ => 8,
        });

        match width {
            0 => {
                assert!(arg < 24);
                $out.push(head | arg as u8);
            }
            1 => {
                $out.push(head | 24);
                $out.push(arg as u8);
            }
            2 => {
                $out.push(head | 25);
                $out.extend_from_slice(&(arg as u16).to_be_bytes());
            }
            4 => {
                $out.push(head | 26);
                $out.extend_from_slice(&(arg as u32).to_be_bytes());
            }
            8 => {
                $out.push(head | 27);
                $out.extend_from_slice(&arg.to_be_bytes());
            }
            w => panic!("invalid argument width: {}", w),
        }
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] ,) => {{
        let _ = $count.unwrap();
    }};
    (@parse[$out:tt, $count:tt] , $($rest:tt)*) => {{
        *$count.unwrap() += 1;
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] h$imm:tt $($rest:tt)*) => {{
        let hex: String = $imm.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(hex.len() % 2, 0, "odd-length hex");
        for i in (0..hex.len()).step_by(2) {
            $out.push(u8::from_str_radix(&hex[i..i + 2], 16).unwrap());
        }
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] t$imm:tt $($rest:tt)*) => {{
        let text: &str = $imm;
        raw_cbor!(@parse[$out, None] 3:(text.len() as u64));
        $out.extend_from_slice(text.as_bytes());
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $imm:tt $($rest:tt)*) => {{
        $out.extend_from_slice($imm.as_ref());
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt]) => {{}};
    ($($tokens:tt)*) => {{
        let mut out = Vec::<u8>::new();
        #[allow(unused)] let _ = raw_cbor!(@parse[out, None] $($tokens)*);
        out
    }};
}

#[test]
fn raw_cbor() {
    assert_eq!(raw_cbor!(0:0), [0x00]);
    assert_eq!(raw_cbor!(1:15), [0x2f]);
    assert_eq!(raw_cbor!(0:24), [0x18, 24]);
    assert_eq!(raw_cbor!(0:500), [0x19, 0x01, 0xf4]);
    assert_eq!(raw_cbor!(0:70000), [0x1a, 0, 1, 0x11, 0x70]);
    assert_eq!(raw_cbor!(0@2:5), [0x19, 0, 5]);

    assert_eq!(raw_cbor!(t"suit"), [0x64, b's', b'u', b'i', b't']);
    assert_eq!(raw_cbor!(h"de ad"), [0xde, 0xad]);
    assert_eq!(raw_cbor!(2 { 0:1 0:2 }), [0x42, 0x01, 0x02]);

    assert_eq!(raw_cbor!(4 []), [0x80]);
    assert_eq!(raw_cbor!(4 [0:1, 0:2,]), [0x82, 0x01, 0x02]);
    assert_eq!(raw_cbor!(5 [0:1 0:2]), [0xa1, 0x01, 0x02]);
}
