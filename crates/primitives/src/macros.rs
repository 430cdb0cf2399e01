pub mod internal {
    // Crate-internal impls shared by the fixed-size buffer types.

    macro_rules! impl_buf_common {
        ($name:ident, $len:expr) => {
            impl $name {
                pub const LEN: usize = $len;

                pub fn new(data: [u8; $len]) -> Self {
                    Self(data)
                }

                pub fn as_slice(&self) -> &[u8] {
                    &self.0
                }

                pub fn as_bytes(&self) -> &[u8; $len] {
                    &self.0
                }

                pub fn zero() -> Self {
                    Self([0; $len])
                }

                pub fn is_zero(&self) -> bool {
                    self.0.iter().all(|v| *v == 0)
                }
            }

            impl ::std::convert::AsRef<[u8; $len]> for $name {
                fn as_ref(&self) -> &[u8; $len] {
                    &self.0
                }
            }

            impl ::std::convert::From<[u8; $len]> for $name {
                fn from(data: [u8; $len]) -> Self {
                    Self(data)
                }
            }

            impl ::std::convert::From<$name> for [u8; $len] {
                fn from(buf: $name) -> Self {
                    buf.0
                }
            }

            impl<'a> ::std::convert::From<&'a [u8; $len]> for $name {
                fn from(data: &'a [u8; $len]) -> Self {
                    Self(*data)
                }
            }

            impl<'a> ::std::convert::TryFrom<&'a [u8]> for $name {
                type Error = &'a [u8];

                fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
                    if value.len() == $len {
                        let mut arr = [0; $len];
                        arr.copy_from_slice(value);
                        Ok(Self(arr))
                    } else {
                        Err(value)
                    }
                }
            }

            impl ::std::default::Default for $name {
                fn default() -> Self {
                    Self([0; $len])
                }
            }

            impl ::std::fmt::Debug for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    // twice as large, required by hex::encode_to_slice.
                    let mut buf = [0; $len * 2];
                    hex::encode_to_slice(self.0, &mut buf).expect("buf: enc hex");
                    f.write_str(unsafe { ::core::str::from_utf8_unchecked(&buf) })
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    // fmt only first and last bits of data.
                    let mut buf = [0; 6];
                    hex::encode_to_slice(&self.0[..3], &mut buf).expect("buf: enc hex");
                    f.write_str(unsafe { ::core::str::from_utf8_unchecked(&buf) })?;
                    f.write_str("..")?;
                    hex::encode_to_slice(&self.0[$len - 3..], &mut buf).expect("buf: enc hex");
                    f.write_str(unsafe { ::core::str::from_utf8_unchecked(&buf) })?;
                    Ok(())
                }
            }

            impl ::borsh::BorshSerialize for $name {
                fn serialize<W: ::std::io::Write>(&self, writer: &mut W) -> ::std::io::Result<()> {
                    writer.write_all(&self.0)
                }
            }

            impl ::borsh::BorshDeserialize for $name {
                fn deserialize_reader<R: ::std::io::Read>(
                    reader: &mut R,
                ) -> ::std::io::Result<Self> {
                    let mut array = [0u8; $len];
                    reader.read_exact(&mut array)?;
                    Ok(array.into())
                }
            }

            impl<'a> ::arbitrary::Arbitrary<'a> for $name {
                fn arbitrary(u: &mut ::arbitrary::Unstructured<'a>) -> ::arbitrary::Result<Self> {
                    let mut array = [0u8; $len];
                    u.fill_buffer(&mut array)?;
                    Ok(array.into())
                }
            }

            impl ::serde::Serialize for $name {
                fn serialize<S: ::serde::Serializer>(
                    &self,
                    serializer: S,
                ) -> Result<S::Ok, S::Error> {
                    serializer.serialize_str(&hex::encode(self.0))
                }
            }

            impl<'de> ::serde::Deserialize<'de> for $name {
                fn deserialize<D: ::serde::Deserializer<'de>>(
                    deserializer: D,
                ) -> Result<Self, D::Error> {
                    let s = <::std::string::String as ::serde::Deserialize>::deserialize(
                        deserializer,
                    )?;
                    let mut array = [0u8; $len];
                    hex::decode_to_slice(&s, &mut array).map_err(::serde::de::Error::custom)?;
                    Ok(array.into())
                }
            }
        };
    }

    pub(crate) use impl_buf_common;
}

#[cfg(test)]
mod test {
    pub struct TestBuf8([u8; 8]);
    crate::macros::internal::impl_buf_common!(TestBuf8, 8);

    #[test]
    fn test_from_into_array() {
        let buf = TestBuf8::new([5u8; 8]);
        let arr: [u8; 8] = buf.into();
        assert_eq!(arr, [5; 8]);
    }

    #[test]
    fn test_zero() {
        assert!(TestBuf8::default().is_zero());
        assert!(!TestBuf8::new([1; 8]).is_zero());
    }

    #[test]
    fn test_try_from_slice() {
        let long = [7u8; 9];
        assert!(TestBuf8::try_from(&long[..]).is_err());
        assert!(TestBuf8::try_from(&long[..8]).is_ok());
    }
}
