//! Convenience macros for KNX addresses.

/// Creates a [`GroupAddress`](crate::addressing::GroupAddress) from 3-level notation.
///
/// Components are range-checked at compile time: main 0-31, middle 0-7,
/// sub 0-255.
///
/// # Examples
///
/// ```
/// use knx_tunnel::ga;
///
/// let light = ga!(1/2/3);
/// assert_eq!(u16::from(light), 0x0A03);
/// assert_eq!(light.to_string(), "1/2/3");
/// ```
///
/// ```compile_fail
/// // main group > 31
/// let addr = knx_tunnel::ga!(32/0/0);
/// ```
///
/// ```compile_fail
/// // middle group > 7
/// let addr = knx_tunnel::ga!(1/8/0);
/// ```
#[macro_export]
macro_rules! ga {
    ($main:literal / $middle:literal / $sub:literal) => {{
        const _: () = {
            if $main > 31 {
                panic!("Main group must be 0-31");
            }
            if $middle > 7 {
                panic!("Middle group must be 0-7");
            }
            if $sub > 255 {
                panic!("Sub group must be 0-255");
            }
        };

        // 5 bits main, 3 bits middle, 8 bits sub
        const RAW: u16 = (($main & 0x1F) << 11) | (($middle & 0x07) << 8) | ($sub & 0xFF);
        $crate::addressing::GroupAddress::from(RAW)
    }};
}
