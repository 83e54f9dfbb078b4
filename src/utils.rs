#[macro_export]
macro_rules! back_to_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::TryFrom<i32> for $name {
            type Error = $crate::error::EmberError;

            fn try_from(v: i32) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as i32 => Ok($name::$vname),)*
                    _ => Err($crate::error::EmberError::S101Decode(format!(
                        "unknown {} variant: {v}", stringify!($name)
                    ))),
                }
            }
        }
    }
}

/// Dot-joins a chain of local element numbers into a path string, e.g.
/// `[1, 3, 2] -> "1.3.2"`.
pub fn path_string(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Parses a dot-joined path string back into its numeric chain.
pub fn parse_path(path: &str) -> Option<Vec<u32>> {
    path.split('.').map(|p| p.parse().ok()).collect()
}

pub fn format_bytes(bytes: &[u8]) -> String {
    format!(
        "[{}]",
        bytes
            .iter()
            .map(|it| format!("0x{it:02x}"))
            .collect::<Vec<String>>()
            .join(", ")
    )
}

pub fn format_byte_size(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{:.0} {}", size, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_round_trips() {
        let numbers = vec![1, 3, 2];
        let path = path_string(&numbers);
        assert_eq!("1.3.2", path);
        assert_eq!(Some(numbers), parse_path(&path));
    }

    #[test]
    fn parse_path_rejects_garbage() {
        assert_eq!(None, parse_path("1.x.2"));
    }
}
