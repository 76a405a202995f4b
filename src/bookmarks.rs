use crate::offsets::{Category, OffsetTable};
use std::io::{self, Write};

#[derive(Clone, PartialEq, Debug)]
pub struct Bookmark {
    pub offset: u64,
    pub category: Category,
    pub description: String,
}

/// Config and limit entries first, then the string markers.
pub fn bookmarks(table: &OffsetTable) -> Vec<Bookmark> {
    let mut marks: Vec<Bookmark> = table
        .entries
        .iter()
        .map(|entry| Bookmark {
            offset: entry.offset,
            category: entry.category,
            description: entry.description.clone(),
        })
        .collect();
    marks.sort_by_key(|mark| mark.category != Category::Config);
    marks.extend(table.markers.iter().map(|marker| Bookmark {
        offset: marker.offset,
        category: Category::Strings,
        description: format!("{} string", marker.name.replace('_', " ")),
    }));
    marks
}

/// Somewhere bookmarks can be placed.
pub trait BookmarkSink {
    fn add(&mut self, bookmark: &Bookmark) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
}

pub fn emit(sink: &mut dyn BookmarkSink, marks: &[Bookmark]) -> io::Result<()> {
    for mark in marks {
        sink.add(mark)?;
    }
    sink.finish()
}

/// Plain listing for creating bookmarks by hand.
pub struct ListingSink<W: Write> {
    out: W,
    current: Option<Category>,
    count: usize,
}

impl<W: Write> ListingSink<W> {
    pub fn new(out: W) -> Self {
        ListingSink {
            out,
            current: None,
            count: 0,
        }
    }
}

impl<W: Write> BookmarkSink for ListingSink<W> {
    fn add(&mut self, bookmark: &Bookmark) -> io::Result<()> {
        if self.current != Some(bookmark.category) {
            writeln!(self.out)?;
            writeln!(self.out, "{} Bookmarks:", bookmark.category)?;
            writeln!(self.out, "{}", "-".repeat(20))?;
            self.current = Some(bookmark.category);
        }
        writeln!(self.out, "  0x{:08x} - {}", bookmark.offset, bookmark.description)?;
        self.count += 1;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "Total bookmarks: {}", self.count)?;
        self.out.flush()
    }
}

/// Emits a Python script for the disassembler's script manager that creates
/// every bookmark through its own API.
pub struct GhidraScriptSink<W: Write> {
    out: W,
    marks: Vec<Bookmark>,
}

impl<W: Write> GhidraScriptSink<W> {
    pub fn new(out: W) -> Self {
        GhidraScriptSink { out, marks: Vec::new() }
    }
}

fn python_str(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

impl<W: Write> BookmarkSink for GhidraScriptSink<W> {
    fn add(&mut self, bookmark: &Bookmark) -> io::Result<()> {
        self.marks.push(bookmark.clone());
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let out = &mut self.out;
        writeln!(out, "# Firmware bookmarks")?;
        writeln!(out, "bookmarks = [")?;
        for mark in &self.marks {
            writeln!(
                out,
                "    (0x{:08x}, {}, {}),",
                mark.offset,
                python_str(&mark.category.to_string()),
                python_str(&mark.description)
            )?;
        }
        writeln!(out, "]")?;
        writeln!(out)?;
        writeln!(out, "space = getCurrentProgram().getAddressFactory().getDefaultAddressSpace()")?;
        writeln!(out, "for offset, category, description in bookmarks:")?;
        writeln!(out, "    createBookmark(space.getAddress(offset), category, description)")?;
        writeln!(out, "    print(\"Created bookmark: \" + description + \" at \" + hex(offset))")?;
        writeln!(out, "print(\"Created %d bookmarks\" % len(bookmarks))")?;
        out.flush()
    }
}
