/// Joins url-encoded tags into the form booru search endpoints expect.
macro_rules! join_tags {
    ($x:expr) => {{
        let tl = $x
            .iter()
            .map(|t| urlencoding::encode(t).into_owned())
            .collect::<Vec<String>>()
            .join("+");
        tl
    }};
}

pub(crate) use join_tags;
