/// Declares a fieldless enum and derives a [TryFrom<u8>] implementation for it.
///
/// Every byte that doesn't match a variant's discriminant is rejected, which is how the VM tells
/// opcodes from garbage:
///
/// ```
/// bytelox::with_try_from_u8! {
///     #[repr(u8)]
///     #[derive(Debug, PartialEq)]
///     enum Direction {
///         Forward,
///         Backward = 7,
///     }
/// }
///
/// assert_eq!(Ok(Direction::Forward), Direction::try_from(0));
/// assert_eq!(Ok(Direction::Backward), Direction::try_from(7));
/// assert_eq!(Err(()), Direction::try_from(1));
/// ```
///
/// Macro adapted from: <https://stackoverflow.com/a/57578431/6626414>
#[macro_export]
macro_rules! with_try_from_u8 {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        // match each variant in the enum
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl ::std::convert::TryFrom<u8> for $name {
            type Error = ();

            fn try_from(v: u8) -> ::std::result::Result<Self, Self::Error> {
                match v {
                    // one arm per variant:
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::chunk::OpCode;

    #[test]
    fn every_opcode_survives_a_trip_through_a_byte() {
        let mut decoded = 0;
        for byte in 0..=u8::MAX {
            if let Ok(opcode) = OpCode::try_from(byte) {
                assert_eq!(byte, opcode as u8);
                decoded += 1;
            }
        }
        assert_eq!(OpCode::Return as usize + 1, decoded);
    }
}
