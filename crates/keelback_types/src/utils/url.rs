use url::Url;

/// Returns the given url with a trailing slash appended to its path when it
/// does not have one yet. Joining a relative segment onto a url without a
/// trailing slash would otherwise replace the final path component.
pub(crate) fn add_trailing_slash(url: &Url) -> Url {
    let path = url.path();
    if path.ends_with('/') {
        url.clone()
    } else {
        let mut url = url.clone();
        url.set_path(&format!("{path}/"));
        url
    }
}

#[cfg(test)]
mod test {
    use super::add_trailing_slash;
    use url::Url;

    #[test]
    fn appends_slash_only_when_missing() {
        let url = Url::parse("https://conda.anaconda.org/conda-forge").unwrap();
        assert_eq!(
            add_trailing_slash(&url).as_str(),
            "https://conda.anaconda.org/conda-forge/"
        );
        assert_eq!(
            add_trailing_slash(&add_trailing_slash(&url)).as_str(),
            "https://conda.anaconda.org/conda-forge/"
        );
    }
}
