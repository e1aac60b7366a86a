use std::collections::BTreeMap;

use harrow_core::error::AppError;
use harrow_core::models::{Extraction, FieldRules};
use harrow_core::traits::Extractor;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// CSS-selector extractor built on `scraper`.
///
/// A document matching the rules' challenge selector is reported as
/// [`Extraction::ChallengeDetected`] before any field is read. Fields whose
/// selector matches nothing come back as empty strings; a document where no
/// field matches at all is not the page we expected and is a
/// [`AppError::FatalExtraction`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CssExtractor;

impl CssExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::ConfigError(format!("Invalid selector '{selector}': {e}")))
}

fn is_challenge(document: &Html, rules: &FieldRules) -> Result<bool, AppError> {
    let selector = parse_selector(&rules.challenge_selector)?;
    Ok(document.select(&selector).next().is_some())
}

/// Element text with runs of whitespace collapsed.
fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

impl Extractor for CssExtractor {
    fn extract(
        &self,
        html: &str,
        rules: &FieldRules,
    ) -> Result<Extraction<BTreeMap<String, String>>, AppError> {
        let document = Html::parse_document(html);
        if is_challenge(&document, rules)? {
            return Ok(Extraction::ChallengeDetected);
        }

        let mut fields = BTreeMap::new();
        let mut matched = 0;
        for rule in &rules.fields {
            let selector = parse_selector(&rule.selector)?;
            let value = document.select(&selector).next().map(|el| match &rule.attribute {
                Some(attr) => el.value().attr(attr).unwrap_or_default().trim().to_string(),
                None => text_of(el),
            });
            if value.is_some() {
                matched += 1;
            }
            fields.insert(rule.name.clone(), value.unwrap_or_default());
        }

        if matched == 0 && !rules.fields.is_empty() {
            return Err(AppError::FatalExtraction(
                "no field selector matched the document".into(),
            ));
        }
        Ok(Extraction::Found(fields))
    }

    fn links(
        &self,
        html: &str,
        base_url: &str,
        rules: &FieldRules,
    ) -> Result<Extraction<Vec<String>>, AppError> {
        let document = Html::parse_document(html);
        if is_challenge(&document, rules)? {
            return Ok(Extraction::ChallengeDetected);
        }

        let base = Url::parse(base_url)
            .map_err(|e| AppError::FatalExtraction(format!("Invalid base URL {base_url}: {e}")))?;
        let selector = parse_selector(&rules.link_selector)?;

        let mut links: Vec<String> = Vec::new();
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href").map(str::trim) else {
                continue;
            };
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
            {
                continue;
            }
            if let Ok(resolved) = base.join(href) {
                let resolved = resolved.to_string();
                if !links.contains(&resolved) {
                    links.push(resolved);
                }
            }
        }
        Ok(Extraction::Found(links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harrow_core::models::FieldRule;

    fn rules() -> FieldRules {
        FieldRules {
            challenge_selector: "body > form".into(),
            link_selector: "a.item".into(),
            fields: vec![
                FieldRule {
                    name: "title".into(),
                    selector: "h1".into(),
                    attribute: None,
                },
                FieldRule {
                    name: "price".into(),
                    selector: ".price".into(),
                    attribute: None,
                },
                FieldRule {
                    name: "image".into(),
                    selector: "img.main".into(),
                    attribute: Some("src".into()),
                },
            ],
        }
    }

    const DETAIL: &str = r#"<html><body>
        <div><h1>  Oak   Table </h1><span class="price">120</span>
        <img class="main" src="/img/oak.jpg"></div>
    </body></html>"#;

    #[test]
    fn test_extracts_fields() {
        let Extraction::Found(fields) = CssExtractor.extract(DETAIL, &rules()).unwrap() else {
            panic!("expected fields");
        };
        assert_eq!(fields["title"], "Oak Table");
        assert_eq!(fields["price"], "120");
        assert_eq!(fields["image"], "/img/oak.jpg");
    }

    #[test]
    fn test_missing_field_is_empty() {
        let html = "<html><body><div><h1>Chair</h1></div></body></html>";
        let Extraction::Found(fields) = CssExtractor.extract(html, &rules()).unwrap() else {
            panic!("expected fields");
        };
        assert_eq!(fields["title"], "Chair");
        assert_eq!(fields["price"], "");
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_challenge_page() {
        let html = r#"<html><body><form action="/check"><input name="captcha"></form></body></html>"#;
        assert_eq!(
            CssExtractor.extract(html, &rules()).unwrap(),
            Extraction::ChallengeDetected
        );
        assert_eq!(
            CssExtractor
                .links(html, "http://site.test/list/1", &rules())
                .unwrap(),
            Extraction::ChallengeDetected
        );
    }

    #[test]
    fn test_unrelated_document_is_fatal() {
        let html = "<html><body><p>Service unavailable</p></body></html>";
        let err = CssExtractor.extract(html, &rules()).unwrap_err();
        assert!(matches!(err, AppError::FatalExtraction(_)));
    }

    #[test]
    fn test_invalid_selector_is_config_error() {
        let mut bad = rules();
        bad.fields[0].selector = "h1[".into();
        let err = CssExtractor.extract(DETAIL, &bad).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_links_resolved_and_deduplicated() {
        let html = r##"<html><body><ul>
            <li><a class="item" href="/item/1">One</a></li>
            <li><a class="item" href="item/2">Two</a></li>
            <li><a class="item" href="https://other.test/item/3">Three</a></li>
            <li><a class="item" href="/item/1">One again</a></li>
            <li><a class="item" href="#top">Top</a></li>
            <li><a href="/about">About</a></li>
        </ul></body></html>"##;
        let Extraction::Found(links) = CssExtractor
            .links(html, "http://site.test/list/", &rules())
            .unwrap()
        else {
            panic!("expected links");
        };
        assert_eq!(
            links,
            vec![
                "http://site.test/item/1",
                "http://site.test/list/item/2",
                "https://other.test/item/3",
            ]
        );
    }
}
