use std::fmt::{Debug, Display, Formatter};

use nom::character::complete::satisfy;
use nom::combinator::{all_consuming, map, map_res};
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::many0;
use nom::sequence::tuple;
use nom::{AsChar, IResult};

pub enum ParserError<I> {
    Custom(anyhow::Error),
    Nom(I, ErrorKind),
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(error) => f.write_fmt(format_args!("Semantic error at {}", error)),
            Self::Nom(input, error) => f.write_fmt(format_args!(
                "Parser error at '{:?}': expecting {:?}",
                input, error
            )),
        }
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I: Display, E: Into<anyhow::Error>> FromExternalError<I, E> for ParserError<I> {
    fn from_external_error(input: I, _: ErrorKind, error: E) -> Self {
        ParserError::Custom(anyhow::anyhow!("'{}': {}", input, error.into()))
    }
}

pub fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Run `parser` over the whole input, turning leftovers into an error.
pub fn consume_all<'a, F: FnMut(&'a str) -> NomResult<'a, O>, O>(
    parser: F,
    input: &'a str,
) -> anyhow::Result<O> {
    all_consuming(parser)(input)
        .map(|(_, ret)| ret)
        .map_err(format_parse_error)
}

fn p_integer_string(input: &str) -> NomResult<String> {
    let parser = tuple((
        satisfy(|c| c.is_dec_digit()),
        many0(satisfy(|c| c.is_dec_digit())),
    ));
    map(parser, |(first, rest)| {
        let mut number = first.to_string();
        number.extend(rest);
        number
    })(input)
}

pub fn p_u64(input: &str) -> NomResult<u64> {
    map_res(p_integer_string, |number| number.parse::<u64>())(input)
}

#[cfg(test)]
mod tests {
    use super::{consume_all, p_u64};

    #[test]
    fn test_parse_u64() {
        assert_eq!(consume_all(p_u64, "0").unwrap(), 0);
        assert_eq!(consume_all(p_u64, "1019").unwrap(), 1019);
        assert_eq!(
            consume_all(p_u64, "1099511627776").unwrap(),
            1024 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(consume_all(p_u64, "").is_err());
        assert!(consume_all(p_u64, "x").is_err());
        assert!(consume_all(p_u64, "10x").is_err());
    }
}
