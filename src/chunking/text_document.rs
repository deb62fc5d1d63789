// Positions are 0-indexed; byte ranges are half-open [start, end).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub character: usize,
    pub byte_offset: usize,
}

impl Position {
    pub fn from_tree_sitter(point: tree_sitter::Point, byte_offset: usize) -> Self {
        Self {
            line: point.row,
            character: point.column,
            byte_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn for_tree_node(node: &tree_sitter::Node) -> Self {
        Self {
            start: Position::from_tree_sitter(node.start_position(), node.start_byte()),
            end: Position::from_tree_sitter(node.end_position(), node.end_byte()),
        }
    }

    pub fn len(&self) -> usize {
        self.end.byte_offset - self.start.byte_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_bytes(&self, start: usize, end: usize) -> bool {
        self.start.byte_offset <= start && end <= self.end.byte_offset
    }
}

/// Byte positions of every newline, for deriving line ranges from byte
/// ranges without re-scanning the text.
pub struct NewlineIndex {
    newlines: Vec<usize>,
}

impl NewlineIndex {
    pub fn new(text: &str) -> Self {
        Self {
            newlines: text
                .bytes()
                .enumerate()
                .filter_map(|(i, b)| (b == b'\n').then_some(i))
                .collect(),
        }
    }

    /// 0-based line containing the byte offset.
    pub fn line_of(&self, byte_offset: usize) -> usize {
        self.newlines.partition_point(|&n| n < byte_offset)
    }

    /// 1-based inclusive line range for a half-open byte range.
    pub fn line_range(&self, start_byte: usize, end_byte: usize) -> (usize, usize) {
        let start = self.line_of(start_byte) + 1;
        let end = self.line_of(end_byte.saturating_sub(1).max(start_byte)) + 1;
        (start, end)
    }
}
