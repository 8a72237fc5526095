// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Renderers for a finished run. Both work on in-memory strings; callers
//! decide where the bytes go.

use std::fmt::Write as _;
use std::io::Cursor;

use anyhow::Result;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::model::{CoverageRate, RunCoverage};

fn rate_attr(rate: CoverageRate) -> String {
    format!("{:.4}", rate.ratio())
}

/// Render a run as a Cobertura XML document.
///
/// Modules become `<package>` elements and source files `<class>` elements,
/// the shape downstream report tooling expects for native coverage.
pub fn cobertura_xml(run: &RunCoverage) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut coverage = BytesStart::new("coverage");
    coverage.push_attribute(("line-rate", rate_attr(run.rate()).as_str()));
    coverage.push_attribute(("lines-covered", run.rate().covered.to_string().as_str()));
    coverage.push_attribute(("lines-valid", run.rate().total.to_string().as_str()));
    coverage.push_attribute(("version", "0"));
    // Fixed timestamp keeps the document reproducible for a given run.
    coverage.push_attribute(("timestamp", "0"));
    writer.write_event(Event::Start(coverage))?;

    writer.write_event(Event::Start(BytesStart::new("sources")))?;
    for module in run.modules() {
        for file in module.files() {
            writer.write_event(Event::Start(BytesStart::new("source")))?;
            writer.write_event(Event::Text(BytesText::new(&file.path().to_string_lossy())))?;
            writer.write_event(Event::End(BytesEnd::new("source")))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("sources")))?;

    writer.write_event(Event::Start(BytesStart::new("packages")))?;
    for module in run.modules() {
        let mut package = BytesStart::new("package");
        package.push_attribute(("name", module.path().to_string_lossy().as_ref()));
        package.push_attribute(("line-rate", rate_attr(module.rate()).as_str()));
        writer.write_event(Event::Start(package))?;
        writer.write_event(Event::Start(BytesStart::new("classes")))?;

        for file in module.files() {
            let name = file
                .path()
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut class = BytesStart::new("class");
            class.push_attribute(("name", name.as_str()));
            class.push_attribute(("filename", file.path().to_string_lossy().as_ref()));
            class.push_attribute(("line-rate", rate_attr(file.rate()).as_str()));
            writer.write_event(Event::Start(class))?;
            writer.write_event(Event::Start(BytesStart::new("lines")))?;

            for line in file.lines() {
                let mut el = BytesStart::new("line");
                el.push_attribute(("number", line.number.to_string().as_str()));
                el.push_attribute(("hits", if line.executed { "1" } else { "0" }));
                writer.write_event(Event::Empty(el))?;
            }

            writer.write_event(Event::End(BytesEnd::new("lines")))?;
            writer.write_event(Event::End(BytesEnd::new("class")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("classes")))?;
        writer.write_event(Event::End(BytesEnd::new("package")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("packages")))?;

    writer.write_event(Event::End(BytesEnd::new("coverage")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}

/// Per-module and per-file covered/total console summary.
pub fn text_summary(run: &RunCoverage) -> String {
    let mut out = String::new();

    let rate = run.rate();
    let _ = writeln!(
        out,
        "{}: {}/{} lines covered ({:.1}%), exit code {}",
        run.name(),
        rate.covered,
        rate.total,
        100.0 * rate.ratio(),
        run.exit_code(),
    );

    for module in run.modules() {
        let rate = module.rate();
        let _ = writeln!(
            out,
            "  {}: {}/{} ({:.1}%)",
            module.path().display(),
            rate.covered,
            rate.total,
            100.0 * rate.ratio(),
        );

        for file in module.files() {
            let rate = file.rate();
            let _ = writeln!(
                out,
                "    {}: {}/{}",
                file.path().display(),
                rate.covered,
                rate.total,
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::Result;

    use super::*;
    use crate::model::RunCoverage;

    fn sample_run() -> RunCoverage {
        let mut run = RunCoverage::new("target.exe");

        let module = run.add_module(Path::new(r"c:\bin\target.exe"));
        let file = run.module_at_mut(module).add_file(Path::new(r"c:\src\main.cpp"));
        {
            let file = run.module_at_mut(module).file_at_mut(file);
            file.add_line(43, true);
            file.add_line(44, true);
            file.add_line(46, false);
        }

        run.compute_rates();
        run
    }

    #[test]
    fn test_cobertura_shape() -> Result<()> {
        let xml = cobertura_xml(&sample_run())?;

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains(r#"<coverage line-rate="0.6667" lines-covered="2" lines-valid="3""#));
        assert!(xml.contains(r#"<package name="c:\bin\target.exe""#));
        assert!(xml.contains(r#"<class name="main.cpp" filename="c:\src\main.cpp""#));
        assert!(xml.contains(r#"<line number="43" hits="1"/>"#));
        assert!(xml.contains(r#"<line number="44" hits="1"/>"#));
        assert!(xml.contains(r#"<line number="46" hits="0"/>"#));
        assert!(xml.contains("</coverage>"));

        Ok(())
    }

    #[test]
    fn test_text_summary() {
        let text = text_summary(&sample_run());

        assert!(text.starts_with("target.exe: 2/3 lines covered (66.7%), exit code 0"));
        assert!(text.contains(r"c:\bin\target.exe: 2/3 (66.7%)"));
        assert!(text.contains(r"c:\src\main.cpp: 2/3"));
    }
}
