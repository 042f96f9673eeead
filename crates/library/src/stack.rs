use common::Folder;

/// In-progress state for one directory on the walk: the catalog record plus
/// flags that only live for the duration of a scan.
#[derive(Debug, Default)]
pub struct FolderFrame {
    pub folder: Folder,
    /// Walk depth of the directory, root is 0.
    pub depth: usize,
    /// The row was written during this walk.
    pub paths_resolved: bool,
    /// A track or a non-empty subdirectory was found below it.
    pub has_content: bool,
    /// Album tags were already copied from a track.
    pub tags_received: bool,
    pub cover: Option<String>,
}

impl FolderFrame {
    pub fn new(folder: Folder, depth: usize, paths_resolved: bool) -> Self {
        Self {
            folder,
            depth,
            paths_resolved,
            ..Self::default()
        }
    }

    pub fn should_persist(&self) -> bool {
        self.paths_resolved && self.has_content
    }
}

#[derive(Debug, Default)]
pub struct FolderStack {
    frames: Vec<FolderFrame>,
}

impl FolderStack {
    pub fn push(&mut self, frame: FolderFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<FolderFrame> {
        self.frames.pop()
    }

    pub fn peek(&self) -> Option<&FolderFrame> {
        self.frames.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut FolderFrame> {
        self.frames.last_mut()
    }

    pub fn peek_id(&self) -> Option<u64> {
        self.peek().map(|frame| frame.folder.id)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
